//! Archetype prompt resolution (spec §4.5.3, glossary "Archetype").
//!
//! An archetype is a named system-prompt template resolved at runtime
//! creation: an explicit `archetypeId` wins, otherwise a `merger` heuristic
//! keys off the allocated id's prefix, otherwise the default worker prompt
//! is used. AGENTS.md/AGENT.md discovery (carried over unchanged from the
//! teacher) is layered on top of whichever base prompt is selected.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const GUIDANCE_FILE_NAMES: &[&str] = &["AGENTS.md", "AGENT.md"];

const MANAGER_PROMPT: &str = r"You are the manager agent for this workspace. You triage incoming user messages, spawn worker agents for discrete tasks, and relay results back to the user. Keep your own responses short; prefer delegating substantive work to a worker.";

const MERGER_PROMPT: &str = r"You are a merger agent. Your job is to reconcile the output of multiple worker agents into a single coherent result and report it back to the manager that spawned you.";

const DEFAULT_WORKER_PROMPT: &str = r"You are a worker agent with access to tools for executing code, editing files, and searching codebases. Use tools when appropriate to accomplish the task you were given, then report the result back to your manager.";

/// A discovered guidance file with its path and content.
#[derive(Debug, Clone)]
pub struct GuidanceFile {
    pub path: PathBuf,
    pub content: String,
}

/// Discover guidance files from the working directory up to the root.
/// Returns files ordered root-first, cwd-last (more specific overrides).
pub fn discover_guidance_files(working_dir: &Path) -> Vec<GuidanceFile> {
    let mut files = Vec::new();
    let mut current = Some(working_dir.to_path_buf());

    while let Some(dir) = current {
        for name in GUIDANCE_FILE_NAMES {
            let path = dir.join(name);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    files.push(GuidanceFile {
                        path: path.clone(),
                        content,
                    });
                    break;
                }
            }
        }
        current = dir.parent().map(Path::to_path_buf);
    }

    files.reverse();
    files
}

/// Resolve which base prompt an agent should use, per spec §4.5.3:
/// "explicit `archetypeId`, or `merger` heuristic by id prefix, or default
/// worker prompt".
pub fn resolve_archetype_prompt(archetype_id: Option<&str>, allocated_agent_id: &str) -> String {
    match archetype_id {
        Some("manager") => MANAGER_PROMPT.to_string(),
        Some("merger") => MERGER_PROMPT.to_string(),
        Some(other) => format!("{DEFAULT_WORKER_PROMPT}\n\nArchetype: {other}"),
        None if allocated_agent_id.starts_with("merger") => MERGER_PROMPT.to_string(),
        None => DEFAULT_WORKER_PROMPT.to_string(),
    }
}

/// Build the complete system prompt for an agent: archetype base prompt
/// plus any AGENTS.md/AGENT.md guidance discovered from `working_dir`.
pub fn build_system_prompt(
    working_dir: &Path,
    archetype_id: Option<&str>,
    allocated_agent_id: &str,
) -> String {
    let mut prompt = resolve_archetype_prompt(archetype_id, allocated_agent_id);

    let guidance_files = discover_guidance_files(working_dir);
    if !guidance_files.is_empty() {
        prompt.push_str("\n\n<project_guidance>\n");
        for (i, file) in guidance_files.iter().enumerate() {
            if i > 0 {
                prompt.push_str("\n---\n\n");
            }
            let display_path = file.path.display();
            let _ = writeln!(prompt, "<!-- From: {display_path} -->");
            prompt.push_str(&file.content);
            if !file.content.ends_with('\n') {
                prompt.push('\n');
            }
        }
        prompt.push_str("</project_guidance>");
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn explicit_archetype_wins_over_prefix_heuristic() {
        let prompt = resolve_archetype_prompt(Some("manager"), "merger-1");
        assert!(prompt.contains("manager agent"));
    }

    #[test]
    fn merger_prefix_heuristic_applies_without_explicit_archetype() {
        let prompt = resolve_archetype_prompt(None, "merger-1");
        assert!(prompt.contains("merger agent"));
    }

    #[test]
    fn falls_back_to_default_worker_prompt() {
        let prompt = resolve_archetype_prompt(None, "worker-1");
        assert!(prompt.contains("worker agent"));
    }

    #[test]
    fn discover_prefers_agents_md_over_agent_md() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("AGENTS.md"), "agents content").unwrap();
        fs::write(temp.path().join("AGENT.md"), "agent content").unwrap();

        let files = discover_guidance_files(temp.path());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "agents content");
    }

    #[test]
    fn build_system_prompt_includes_guidance() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("AGENTS.md"),
            "# Project Rules\nBe nice.",
        )
        .unwrap();

        let prompt = build_system_prompt(temp.path(), None, "worker-1");
        assert!(prompt.contains("<project_guidance>"));
        assert!(prompt.contains("Be nice."));
    }
}
