//! `.env` file materialization: `KEY=value` lines, replace-or-append per key.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Sets each `(key, value)` in `content`. The first line assigning a key is
/// rewritten, later duplicates of that key are dropped, keys not present are
/// appended. Every other line is kept verbatim.
pub fn upsert_env_vars(content: &str, vars: &[(String, String)]) -> Result<String> {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (key, value) in vars {
        let pattern = Regex::new(&format!(r"^\s*{}\s*=", regex::escape(key)))
            .with_context(|| format!("invalid env key '{}'", key))?;
        let assignment = format!("{}={}", key, value);

        let mut replaced = false;
        lines.retain_mut(|line| {
            if !pattern.is_match(line) {
                return true;
            }
            if replaced {
                return false;
            }
            *line = assignment.clone();
            replaced = true;
            true
        });
        if !replaced {
            lines.push(assignment);
        }
    }

    let mut out = lines.join(newline);
    out.push_str(newline);
    Ok(out)
}

/// Writes `PORT=<port>` plus `extra_vars` into `<dir>/<file_name>`, creating the
/// file if needed, and returns its path.
pub fn write_env_file(
    dir: &Path,
    file_name: &str,
    port: u16,
    extra_vars: &[(String, String)],
) -> Result<PathBuf> {
    let path = dir.join(file_name);
    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };

    let mut vars = vec![("PORT".to_string(), port.to_string())];
    vars.extend(extra_vars.iter().cloned());
    let updated = upsert_env_vars(&existing, &vars)?;

    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    fs::write(&path, updated).with_context(|| format!("write {}", path.display()))?;
    tracing::info!("Configured env file {} (PORT={})", path.display(), port);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn replaces_existing_and_keeps_other_lines() {
        let input = "# bot settings\nPORT=1234\nLOG_LEVEL=DEBUG\nHOST=127.0.0.1\n";
        let out = upsert_env_vars(input, &vars(&[("PORT", "5555"), ("LOG_LEVEL", "INFO")])).unwrap();
        assert_eq!(out, "# bot settings\nPORT=5555\nLOG_LEVEL=INFO\nHOST=127.0.0.1\n");
    }

    #[test]
    fn appends_missing_keys() {
        let out = upsert_env_vars("HOST=0.0.0.0", &vars(&[("PORT", "8001")])).unwrap();
        assert_eq!(out, "HOST=0.0.0.0\nPORT=8001\n");
    }

    #[test]
    fn key_match_is_exact() {
        let input = "API_PORT=1\nPORTAL=x\nPORT=2\n";
        let out = upsert_env_vars(input, &vars(&[("PORT", "3")])).unwrap();
        assert_eq!(out, "API_PORT=1\nPORTAL=x\nPORT=3\n");
    }

    #[test]
    fn duplicate_assignments_collapse() {
        let out = upsert_env_vars("PORT=1\nA=b\nPORT=2\n", &vars(&[("PORT", "9")])).unwrap();
        assert_eq!(out, "PORT=9\nA=b\n");
    }

    #[test]
    fn regex_metacharacters_in_keys_are_literal() {
        let out = upsert_env_vars("A.B=1\nAxB=2\n", &vars(&[("A.B", "3")])).unwrap();
        assert_eq!(out, "A.B=3\nAxB=2\n");
    }

    #[test]
    fn crlf_files_stay_crlf() {
        let out = upsert_env_vars("PORT=1\r\nX=y\r\n", &vars(&[("PORT", "2")])).unwrap();
        assert_eq!(out, "PORT=2\r\nX=y\r\n");
    }

    #[test]
    fn writes_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_env_file(tmp.path(), ".env", 8002, &vars(&[("QQ", "10001")])).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "PORT=8002\nQQ=10001\n");
    }
}
