mod support;

use assert_cmd::Command;
use predicates::str::contains;

use support::TestProject;

#[test]
fn taskdb_help_works() {
    Command::cargo_bin("taskdb")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Tagged hierarchical task-dependency store"));
}

#[test]
fn subcommand_help_works() {
    let subcommands = [
        "init",
        "add",
        "show",
        "list",
        "set-status",
        "update",
        "remove",
        "dep",
        "next",
        "validate",
        "tag",
        "move",
    ];

    for cmd in subcommands {
        Command::cargo_bin("taskdb")
            .expect("binary")
            .arg(cmd)
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn init_creates_layout_once() {
    let project = TestProject::new();
    project
        .taskdb()
        .arg("init")
        .assert()
        .success()
        .stdout(contains("initialized project"));

    assert!(project.path().join(".taskdb.toml").is_file());
    assert!(project.tasks_file().is_file());
    let gitignore = std::fs::read_to_string(project.path().join(".gitignore")).unwrap();
    assert!(gitignore.contains("/.taskdb/backups/"));

    project
        .taskdb()
        .arg("init")
        .assert()
        .success()
        .stdout(contains("nothing to do"));
}

#[test]
fn add_list_and_complete_tasks() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();

    let added = project.json(&["add", "Design schema", "--priority", "high"]);
    assert_eq!(added["status"], "success");
    assert_eq!(added["command"], "add");
    assert_eq!(added["data"]["task"]["id"], "1");

    let blocked = project.json(&["add", "Write migration", "--dep", "1"]);
    assert_eq!(blocked["data"]["task"]["status"], "blocked");

    project
        .taskdb()
        .args(["add", "Pick column types", "--parent", "1"])
        .assert()
        .success()
        .stdout(contains("Created task 1.1"));

    let listed = project.json(&["list"]);
    let ids: Vec<&str> = listed["data"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["1", "1.1", "2"]);

    project
        .taskdb()
        .args(["set-status", "1", "in-progress"])
        .assert()
        .success();
    let done = project.json(&["set-status", "1", "done"]);
    let changes = done["data"]["changes"].as_array().unwrap();
    assert!(changes
        .iter()
        .any(|change| change["id"] == "2" && change["to"] == "pending"));
}

#[test]
fn cycles_exit_with_policy_code() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();
    project.taskdb().args(["add", "a"]).assert().success();
    project.taskdb().args(["add", "b", "--dep", "1"]).assert().success();

    project
        .taskdb()
        .args(["dep", "add", "1", "2"])
        .assert()
        .code(3)
        .stderr(contains("Circular dependency"));

    let err = project.json(&["dep", "add", "1", "2"]);
    assert_eq!(err["status"], "error");
    assert_eq!(err["command"], "dep add");
    assert_eq!(err["error"]["kind"], "policy_blocked");
    assert_eq!(
        err["error"]["details"]["cycle_path"],
        serde_json::json!(["1", "2", "1"])
    );
}

#[test]
fn bad_input_exits_with_user_error() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();

    project
        .taskdb()
        .args(["show", "1.0"])
        .assert()
        .code(2)
        .stderr(contains("Invalid task id"));
    project
        .taskdb()
        .args(["list", "--tag", "Not_Valid"])
        .assert()
        .code(2);
    project
        .taskdb()
        .args(["show", "7"])
        .assert()
        .code(2)
        .stderr(contains("not found"));
}

#[test]
fn remove_requires_force_for_used_tasks() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();
    project.taskdb().args(["add", "base"]).assert().success();
    project.taskdb().args(["add", "user", "--dep", "1"]).assert().success();

    project.taskdb().args(["remove", "1"]).assert().code(3);
    let removed = project.json(&["remove", "1", "--force"]);
    assert_eq!(removed["data"]["removed"], serde_json::json!(["1"]));

    let validated = project.json(&["validate"]);
    assert_eq!(validated["data"]["clean"], false);

    project.taskdb().args(["dep", "fix"]).assert().success();
    let validated = project.json(&["validate"]);
    assert_eq!(validated["data"]["clean"], true);
}

#[test]
fn tag_lifecycle() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();
    project.taskdb().args(["add", "shared"]).assert().success();

    project
        .taskdb()
        .args(["tag", "copy", "master", "feature-x"])
        .assert()
        .success();
    project
        .taskdb()
        .args(["tag", "use", "feature-x"])
        .assert()
        .success();
    project
        .taskdb()
        .args(["add", "only in feature"])
        .assert()
        .success()
        .stdout(contains("Created task 2 in feature-x"));

    let tags = project.json(&["tag", "list"]);
    assert_eq!(tags["data"]["current"], "feature-x");
    assert_eq!(tags["data"]["tags"].as_array().unwrap().len(), 2);

    project
        .taskdb()
        .args(["tag", "delete", "feature-x"])
        .assert()
        .code(3);
    project
        .taskdb()
        .args(["tag", "rename", "feature-x", "feature-y"])
        .assert()
        .success();
    project.taskdb().args(["tag", "use", "master"]).assert().success();
    project
        .taskdb()
        .args(["tag", "delete", "feature-y"])
        .assert()
        .success();

    let tags = project.json(&["tag", "list", "feature-*"]);
    assert!(tags["data"]["tags"].as_array().unwrap().is_empty());
}

#[test]
fn move_tasks_between_tags() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();
    project.taskdb().args(["add", "base"]).assert().success();
    project.taskdb().args(["add", "feature", "--dep", "1"]).assert().success();
    project.taskdb().args(["tag", "add", "later"]).assert().success();

    project.taskdb().args(["move", "later", "2"]).assert().code(3);

    let moved = project.json(&["move", "later", "2", "--ignore-dependencies"]);
    assert_eq!(moved["data"]["moved"], serde_json::json!(["2"]));

    let shown = project.json(&["show", "2", "--tag", "later"]);
    assert_eq!(
        shown["data"]["task"]["dependencies"],
        serde_json::json!(["master:1"])
    );
}

#[test]
fn tag_from_git_branch() {
    let project = TestProject::with_git_branch("feature/user-auth").expect("git repo");
    project.taskdb().arg("init").assert().success();

    let created = project.json(&["tag", "add", "--from-branch"]);
    assert_eq!(created["data"]["name"], "feature-user-auth");
    assert_eq!(created["data"]["git_branch"], "feature/user-auth");
}

#[test]
fn dir_flag_and_env_select_the_project() {
    let project = TestProject::new();
    let elsewhere = tempfile::tempdir().expect("tempdir");

    Command::cargo_bin("taskdb")
        .expect("binary")
        .current_dir(elsewhere.path())
        .arg("--dir")
        .arg(project.path())
        .arg("init")
        .assert()
        .success();
    assert!(project.tasks_file().is_file());

    Command::cargo_bin("taskdb")
        .expect("binary")
        .current_dir(elsewhere.path())
        .env("TASKDB_DIR", project.path())
        .args(["add", "via env"])
        .assert()
        .success();

    let listed = project.json(&["list", "--quiet"]);
    assert_eq!(listed["data"]["count"], 1);
}

#[test]
fn next_picks_unblocked_work() {
    let project = TestProject::new();
    project.taskdb().arg("init").assert().success();
    project.taskdb().args(["add", "low", "--priority", "low"]).assert().success();
    project.taskdb().args(["add", "high", "--priority", "high"]).assert().success();
    project
        .taskdb()
        .args(["add", "waits", "--priority", "high", "--dep", "1"])
        .assert()
        .success();

    let next = project.json(&["next"]);
    assert_eq!(next["data"]["task"]["id"], "2");

    project
        .taskdb()
        .arg("next")
        .assert()
        .success()
        .stdout(contains("Next: 2 high"));
}
