use ab_core::checkout::{Checkout, GitAuth, START_BRANCH};
use ab_core::config::CommitterConfig;
use git2::{Repository, Signature};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures: a bare origin repo seeded without a working tree
// ---------------------------------------------------------------------------

fn committer() -> CommitterConfig {
    CommitterConfig {
        author_name: "GitOps Autobot".into(),
        author_email: "autobot@example.com".into(),
    }
}

/// Commit the full file set as a new tree on `refs/heads/main`.
fn seed_commit(repo: &Repository, files: &[(&str, &str)], message: &str) -> git2::Oid {
    let sig = Signature::now("Seed", "seed@example.com").expect("signature");
    let mut builder = repo.treebuilder(None).expect("treebuilder");
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).expect("blob");
        builder.insert(name, blob, 0o100644).expect("tree entry");
    }
    let tree = repo
        .find_tree(builder.write().expect("tree"))
        .expect("find tree");
    let parent = repo
        .refname_to_id("refs/heads/main")
        .ok()
        .and_then(|oid| repo.find_commit(oid).ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("refs/heads/main"), &sig, &sig, message, &tree, &parents)
        .expect("commit")
}

fn bare_origin(files: &[(&str, &str)]) -> (TempDir, Repository) {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = Repository::init_bare(dir.path()).expect("init bare");
    seed_commit(&repo, files, "initial commit");
    (dir, repo)
}

fn clone_checkout(origin: &TempDir) -> (TempDir, Checkout) {
    let scratch = tempfile::tempdir().expect("scratch dir");
    let co = Checkout::clone_into(
        scratch.path(),
        origin.path().to_str().expect("utf8 path"),
        "main",
        &GitAuth::Anonymous,
    )
    .expect("clone");
    (scratch, co)
}

fn local_branches(co: &Checkout) -> Vec<String> {
    let repo = Repository::open(co.workdir()).expect("open");
    let mut names: Vec<String> = repo
        .branches(Some(git2::BranchType::Local))
        .expect("branches")
        .filter_map(|b| b.ok())
        .filter_map(|(b, _)| b.name().ok().flatten().map(String::from))
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn clone_fails_for_missing_branch() {
    let (origin, _repo) = bare_origin(&[("README.md", "hello\n")]);
    let scratch = tempfile::tempdir().expect("scratch dir");
    let result = Checkout::clone_into(
        scratch.path(),
        origin.path().to_str().expect("utf8 path"),
        "no-such-branch",
        &GitAuth::Anonymous,
    );
    assert!(result.is_err());
}

#[test]
fn clean_leaves_exactly_the_sentinel_at_the_remote_tip() {
    let (origin, origin_repo) = bare_origin(&[("README.md", "hello\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    co.clean().expect("clean");
    assert_eq!(local_branches(&co), vec![START_BRANCH.to_string()]);

    let repo = Repository::open(co.workdir()).expect("open");
    let sentinel = repo
        .refname_to_id(&format!("refs/heads/{START_BRANCH}"))
        .expect("sentinel ref");
    let remote_tip = origin_repo
        .refname_to_id("refs/heads/main")
        .expect("origin tip");
    assert_eq!(sentinel, remote_tip);
}

#[test]
fn clean_is_idempotent() {
    let (origin, _repo) = bare_origin(&[("README.md", "hello\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    co.clean().expect("first clean");
    let first = local_branches(&co);
    co.clean().expect("second clean");
    assert_eq!(local_branches(&co), first);
}

#[test]
fn clean_deletes_candidate_branches_and_resets_stray_files() {
    let (origin, _repo) = bare_origin(&[("README.md", "hello\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    co.clean().expect("clean");
    co.begin_branch("filechange_README.md").expect("branch");
    std::fs::write(co.workdir().join("stray.txt"), "junk").expect("write");

    co.clean().expect("clean again");
    assert_eq!(local_branches(&co), vec![START_BRANCH.to_string()]);
    assert!(!co.workdir().join("stray.txt").exists());
    assert!(co.status_is_empty().expect("status"));
}

#[test]
fn refresh_moves_the_base_to_the_new_remote_tip() {
    let (origin, origin_repo) = bare_origin(&[("config.yaml", "time=old\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    let new_tip = seed_commit(
        &origin_repo,
        &[("config.yaml", "time=newer\n")],
        "upstream change",
    );

    co.refresh(&GitAuth::Anonymous).expect("refresh");
    co.clean().expect("clean");

    let repo = Repository::open(co.workdir()).expect("open");
    let sentinel = repo
        .refname_to_id(&format!("refs/heads/{START_BRANCH}"))
        .expect("sentinel ref");
    assert_eq!(sentinel, new_tip);

    let files = co.base_files().expect("base files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].content, "time=newer\n");
}

#[test]
fn current_policy_is_none_when_the_file_is_absent() {
    let (origin, _repo) = bare_origin(&[("README.md", "hello\n")]);
    let (_scratch, co) = clone_checkout(&origin);
    co.clean().expect("clean");
    assert!(co.current_policy().expect("policy").is_none());
}

#[test]
fn current_policy_parses_the_checked_in_file() {
    let (origin, _repo) = bare_origin(&[
        ("README.md", "hello\n"),
        (
            ".gitops-autobot",
            "allowAutoReview: true\nchangeMakers:\n  - name: time\n",
        ),
    ]);
    let (_scratch, co) = clone_checkout(&origin);
    co.clean().expect("clean");
    let policy = co.current_policy().expect("policy").expect("present");
    assert!(policy.allow_auto_review);
    assert_eq!(policy.change_makers[0].name, "time");
}

#[test]
fn commit_and_push_derives_pr_title_and_body() {
    let (origin, origin_repo) = bare_origin(&[("config.yaml", "time=old\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    co.clean().expect("clean");
    co.begin_branch("filechange_config.yaml").expect("branch");
    co.commit_files(
        &[("config.yaml".to_string(), "time=new\n".to_string())],
        "time update\n\nUpdated time to new",
        &committer(),
    )
    .expect("commit");

    let pushed = co.push_new_branches(&GitAuth::Anonymous).expect("push");
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].branch, "filechange_config.yaml");
    assert_eq!(pushed[0].title, "time update");
    assert_eq!(pushed[0].body, "Updated time to new");

    assert!(origin_repo
        .refname_to_id("refs/heads/filechange_config.yaml")
        .is_ok());
}

#[test]
fn diverged_branch_is_skipped_not_an_error() {
    let (origin, _origin_repo) = bare_origin(&[("config.yaml", "time=old\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    // First run pushes the candidate branch.
    co.clean().expect("clean");
    co.begin_branch("filechange_config.yaml").expect("branch");
    co.commit_files(
        &[("config.yaml".to_string(), "time=first\n".to_string())],
        "time update\n\nUpdated time to first",
        &committer(),
    )
    .expect("commit");
    assert_eq!(
        co.push_new_branches(&GitAuth::Anonymous)
            .expect("push")
            .len(),
        1
    );

    // Second run rebuilds the same branch with different content; the remote
    // already holds the old tip, so the push must be skipped, not fail.
    co.clean().expect("clean");
    co.begin_branch("filechange_config.yaml").expect("branch");
    co.commit_files(
        &[("config.yaml".to_string(), "time=second\n".to_string())],
        "time update\n\nUpdated time to second",
        &committer(),
    )
    .expect("commit");
    let pushed = co.push_new_branches(&GitAuth::Anonymous).expect("push");
    assert!(pushed.is_empty());
}

#[test]
fn commit_all_picks_up_untracked_files() {
    let (origin, _repo) = bare_origin(&[("README.md", "hello\n")]);
    let (_scratch, co) = clone_checkout(&origin);

    co.clean().expect("clean");
    co.begin_branch("shellchange_makertest").expect("branch");
    assert!(co.status_is_empty().expect("status"));

    std::fs::write(co.workdir().join("generated.txt"), "made by a tool\n").expect("write");
    assert!(!co.status_is_empty().expect("status"));

    co.commit_all("shell command makertest\n\nRan command makertest", &committer())
        .expect("commit all");
    assert!(co.status_is_empty().expect("status"));

    let pushed = co.push_new_branches(&GitAuth::Anonymous).expect("push");
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].branch, "shellchange_makertest");
}
