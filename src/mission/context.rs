//! Repository context assembly for planner and coder prompts.
//!
//! Reads the host side of the sandbox mount: a bounded file tree,
//! `package.json` and the README. All reads are best-effort; a missing or
//! unreadable file just leaves its section out of the prompt.

use std::path::Path;

use crate::llm::artifacts::RepoContext;

/// Directories that never belong in a prompt.
const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "dist", "build", "target", ".next"];

/// Cap on file-tree entries so huge repos stay promptable.
const MAX_TREE_ENTRIES: usize = 200;

const MAX_TREE_DEPTH: usize = 4;

/// Collect planning context from the repository directory.
pub fn collect_repo_context(repo: &Path) -> RepoContext {
    let file_tree = build_file_tree(repo);
    let repo_present = file_tree.is_some();
    let package_json = std::fs::read_to_string(repo.join("package.json")).ok();
    let readme = ["README.md", "readme.md", "README"]
        .iter()
        .find_map(|name| std::fs::read_to_string(repo.join(name)).ok());

    RepoContext {
        repo_present,
        file_tree,
        package_json,
        readme,
        custom_instructions: None,
    }
}

/// Render a sorted, indented tree of the repository, or `None` when the
/// directory is empty (fresh sandbox without a cloned repo).
pub fn build_file_tree(repo: &Path) -> Option<String> {
    let mut lines = Vec::new();
    walk(repo, 0, &mut lines);
    if lines.is_empty() {
        return None;
    }
    if lines.len() > MAX_TREE_ENTRIES {
        let dropped = lines.len() - MAX_TREE_ENTRIES;
        lines.truncate(MAX_TREE_ENTRIES);
        lines.push(format!("… ({dropped} more entries)"));
    }
    Some(lines.join("\n"))
}

fn walk(dir: &Path, depth: usize, lines: &mut Vec<String>) {
    if depth >= MAX_TREE_DEPTH || lines.len() > MAX_TREE_ENTRIES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut names: Vec<(String, bool)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && IGNORED_DIRS.contains(&name.as_str()) {
                return None;
            }
            Some((name, is_dir))
        })
        .collect();
    names.sort();

    for (name, is_dir) in names {
        let indent = "  ".repeat(depth);
        if is_dir {
            lines.push(format!("{indent}{name}/"));
            walk(&dir.join(&name), depth + 1, lines);
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_repo_has_no_tree_and_no_repo_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = collect_repo_context(dir.path());
        assert!(!ctx.repo_present);
        assert!(ctx.file_tree.is_none());
        assert!(ctx.package_json.is_none());
    }

    #[test]
    fn tree_skips_ignored_directories_and_reads_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).expect("mkdir src");
        std::fs::create_dir_all(dir.path().join("node_modules/leftpad")).expect("mkdir nm");
        std::fs::write(dir.path().join("src/index.js"), "console.log(1)").expect("write");
        std::fs::write(dir.path().join("package.json"), r#"{"name":"x"}"#).expect("write");
        std::fs::write(dir.path().join("README.md"), "# x").expect("write");

        let ctx = collect_repo_context(dir.path());
        assert!(ctx.repo_present);
        let tree = ctx.file_tree.expect("tree present");
        assert!(tree.contains("src/"));
        assert!(tree.contains("  index.js"));
        assert!(!tree.contains("node_modules"));
        assert_eq!(ctx.package_json.as_deref(), Some(r#"{"name":"x"}"#));
        assert_eq!(ctx.readme.as_deref(), Some("# x"));
    }

    #[test]
    fn oversized_trees_are_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..(MAX_TREE_ENTRIES + 50) {
            std::fs::write(dir.path().join(format!("file-{i:04}.txt")), "x").expect("write");
        }
        let tree = build_file_tree(dir.path()).expect("tree present");
        assert!(tree.lines().count() <= MAX_TREE_ENTRIES + 1);
        assert!(tree.ends_with("more entries)"));
    }
}
