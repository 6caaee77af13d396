//! Validation pass for `skill_change` tasks.
//!
//! A skill lives in `<skills_dir>/<name>/` with a `SKILL.md` whose YAML
//! frontmatter must satisfy the manifest schema. Scripts under `scripts/`
//! must be executable and pass a syntax check.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, warn};

use crate::io::process::run_command_with_timeout;

const MANIFEST_SCHEMA: &str = include_str!("../schemas/skill_manifest.schema.json");
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const CHECK_OUTPUT_LIMIT: usize = 16 * 1024;

/// Outcome of validating one skill directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SkillReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors joined one per line, for use as step failure context.
    pub fn failure_text(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("\n"))
    }
}

/// Validate `skills_dir/skill_name` inside `workspace`.
pub fn validate_skill(workspace: &Path, skills_dir: &str, skill_name: &str) -> Result<SkillReport> {
    let dir = workspace.join(skills_dir).join(skill_name);
    let mut report = SkillReport::default();
    if !dir.is_dir() {
        report
            .errors
            .push(format!("skill directory {skills_dir}/{skill_name} does not exist"));
        return Ok(report);
    }

    let manifest_path = dir.join("SKILL.md");
    match fs::read_to_string(&manifest_path) {
        Ok(contents) => check_manifest(&contents, skill_name, &mut report)?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            report.errors.push("SKILL.md is missing".to_string());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", manifest_path.display()));
        }
    }

    let scripts = dir.join("scripts");
    if scripts.is_dir() {
        let mut entries = fs::read_dir(&scripts)
            .with_context(|| format!("read {}", scripts.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("list {}", scripts.display()))?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.is_file() {
                check_script(&path, &mut report)?;
            }
        }
    }

    debug!(
        skill = skill_name,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "skill validated"
    );
    Ok(report)
}

/// Split `---`-delimited YAML frontmatter from the top of a markdown file.
fn split_frontmatter(contents: &str) -> Option<&str> {
    let rest = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

fn check_manifest(contents: &str, skill_name: &str, report: &mut SkillReport) -> Result<()> {
    let Some(frontmatter) = split_frontmatter(contents) else {
        report
            .errors
            .push("SKILL.md has no YAML frontmatter".to_string());
        return Ok(());
    };
    let yaml: serde_yaml::Value = match serde_yaml::from_str(frontmatter) {
        Ok(v) => v,
        Err(err) => {
            report
                .errors
                .push(format!("SKILL.md frontmatter is not valid YAML: {err}"));
            return Ok(());
        }
    };
    let manifest = serde_json::to_value(&yaml).context("convert frontmatter to JSON")?;

    let schema: Value = serde_json::from_str(MANIFEST_SCHEMA).context("parse manifest schema")?;
    let validator = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    report.errors.extend(
        validator
            .iter_errors(&manifest)
            .map(|err| format!("SKILL.md frontmatter: {err}")),
    );

    if let Some(name) = manifest.get("name").and_then(Value::as_str)
        && name != skill_name
    {
        report.warnings.push(format!(
            "SKILL.md name '{name}' differs from directory '{skill_name}'"
        ));
    }
    Ok(())
}

fn check_script(path: &Path, report: &mut SkillReport) -> Result<()> {
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !is_executable(path)? {
        report
            .errors
            .push(format!("scripts/{label} is not executable"));
    }

    let path_str = path.to_string_lossy().into_owned();
    let cmd = match path.extension().and_then(|e| e.to_str()) {
        Some("sh" | "bash") => {
            let mut cmd = Command::new("bash");
            cmd.args(["-n", &path_str]);
            cmd
        }
        Some("py") => {
            let mut cmd = Command::new("python3");
            cmd.args([
                "-c",
                "import ast, sys; ast.parse(open(sys.argv[1]).read(), sys.argv[1])",
                &path_str,
            ]);
            cmd
        }
        _ => return Ok(()),
    };
    let program = cmd.get_program().to_string_lossy().into_owned();

    match run_command_with_timeout(cmd, None, CHECK_TIMEOUT, CHECK_OUTPUT_LIMIT) {
        Ok(Some(out)) if out.success => {}
        Ok(Some(out)) => report.errors.push(format!(
            "scripts/{label} failed syntax check: {}",
            out.combined().trim()
        )),
        Ok(None) => report
            .errors
            .push(format!("scripts/{label} syntax check timed out")),
        Err(err) if is_not_found(&err) => {
            warn!(program = %program, "syntax checker not installed");
            report
                .warnings
                .push(format!("scripts/{label}: {program} not available, syntax not checked"));
        }
        Err(err) => return Err(err).with_context(|| format!("check scripts/{label}")),
    }
    Ok(())
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions()
        .mode();
    Ok(mode & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, manifest: &str) -> std::path::PathBuf {
        let dir = root.join("skills").join("weather");
        fs::create_dir_all(dir.join("scripts")).expect("mkdir");
        fs::write(dir.join("SKILL.md"), manifest).expect("write manifest");
        dir
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[test]
    fn valid_skill_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = write_skill(
            temp.path(),
            "---\nname: weather\ndescription: Report the weather\n---\n# Weather\n",
        );
        let script = dir.join("scripts").join("fetch.sh");
        fs::write(&script, "#!/usr/bin/env bash\necho ok\n").expect("write script");
        #[cfg(unix)]
        make_executable(&script);

        let report = validate_skill(temp.path(), "skills", "weather").expect("validate");
        assert!(report.is_ok(), "{report:?}");
    }

    #[test]
    fn missing_description_fails_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_skill(temp.path(), "---\nname: weather\n---\nbody\n");
        let report = validate_skill(temp.path(), "skills", "weather").expect("validate");
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("description"), "{report:?}");
    }

    #[test]
    fn manifest_without_frontmatter_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_skill(temp.path(), "# Weather\n");
        let report = validate_skill(temp.path(), "skills", "weather").expect("validate");
        assert_eq!(
            report.failure_text().as_deref(),
            Some("SKILL.md has no YAML frontmatter")
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_script_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = write_skill(
            temp.path(),
            "---\nname: weather\ndescription: Report the weather\n---\n",
        );
        let script = dir.join("scripts").join("fetch.sh");
        fs::write(&script, "echo ok\n").expect("write script");
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod");
        }
        let report = validate_skill(temp.path(), "skills", "weather").expect("validate");
        assert_eq!(report.errors, vec!["scripts/fetch.sh is not executable".to_string()]);
    }

    #[test]
    fn missing_directory_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = validate_skill(temp.path(), "skills", "absent").expect("validate");
        assert!(!report.is_ok());
    }
}
