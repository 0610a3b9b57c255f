use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// What a rules file declares for one secret.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub public_keys: Vec<String>,
    #[serde(default)]
    pub armor: bool,
}

/// Secret names mapped to their rules, plus the directory the names are
/// relative to.
#[derive(Debug, Clone)]
pub struct Rules {
    dir: PathBuf,
    rules: BTreeMap<String, Rule>,
}

impl Rules {
    /// Reads `*.json` rules directly and evaluates anything else as a Nix
    /// expression with `nix_instantiate`.
    pub fn load(path: &Path, nix_instantiate: &str) -> Result<Self> {
        let path = path
            .canonicalize()
            .map_err(|err| Error::Rules(format!("{}: {}", path.display(), err)))?;
        let json = if path.extension().is_some_and(|ext| ext == "json") {
            fs::read_to_string(&path)
                .map_err(|err| Error::Rules(format!("{}: {}", path.display(), err)))?
        } else {
            evaluate_nix(&path, nix_instantiate)?
        };
        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        Self::from_json(dir, &json)
    }

    pub fn from_json(dir: PathBuf, json: &str) -> Result<Self> {
        let rules: BTreeMap<String, Rule> =
            serde_json::from_str(json).map_err(|err| Error::Rules(err.to_string()))?;
        debug!(dir = %dir.display(), count = rules.len(), "loaded rules");
        Ok(Rules { dir, rules })
    }

    /// The directory rule names are relative to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(name, rule)| (name.as_str(), rule))
    }
}

fn evaluate_nix(path: &Path, nix_instantiate: &str) -> Result<String> {
    let expr = format!(
        "builtins.mapAttrs (name: rule: {{ publicKeys = rule.publicKeys or []; armor = rule.armor or false; }}) (import {})",
        nix_string(&path.to_string_lossy())
    );
    debug!(%expr, "evaluating rules");
    let output = Command::new(nix_instantiate)
        .args(["--eval", "--strict", "--json", "-E"])
        .arg(&expr)
        .output()
        .map_err(|err| Error::Rules(format!("cannot run {}: {}", nix_instantiate, err)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Rules(format!(
            "evaluating {} failed: {}",
            path.display(),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout).map_err(|err| Error::Rules(err.to_string()))
}

/// Quotes `s` as a Nix string literal.
fn nix_string(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '$' if chars.peek() == Some(&'{') => quoted.push_str("\\$"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::{nix_string, Rule, Rules};
    use crate::error::Error;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_json_rules() -> std::io::Result<()> {
        let tmp_dir = TempDir::new()?;
        let path = tmp_dir.path().join("secrets.json");
        fs::write(
            &path,
            r#"{
                "passwordfile.age": {"publicKeys": ["age1abc"], "extra": 1},
                "armored.age": {"publicKeys": [], "armor": true}
            }"#,
        )?;
        let rules = Rules::load(&path, "nix-instantiate").unwrap();
        assert_eq!(rules.dir(), tmp_dir.path().canonicalize()?);
        assert_eq!(
            rules.get("passwordfile.age"),
            Some(&Rule {
                public_keys: vec!["age1abc".to_string()],
                armor: false,
            })
        );
        assert!(rules.get("armored.age").unwrap().armor);
        let names: Vec<&str> = rules.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["armored.age", "passwordfile.age"]);
        tmp_dir.close()
    }

    #[test]
    fn test_missing_rules_file() {
        assert!(matches!(
            Rules::load(Path::new("/nonexistent/secrets.nix"), "nix-instantiate"),
            Err(Error::Rules(_))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Rules::from_json("/".into(), "[1, 2]"),
            Err(Error::Rules(_))
        ));
    }

    #[test]
    fn test_nix_evaluator_failure() -> std::io::Result<()> {
        let tmp_dir = TempDir::new()?;
        let path = tmp_dir.path().join("secrets.nix");
        fs::write(&path, "{ }")?;
        assert!(matches!(
            Rules::load(&path, "false"),
            Err(Error::Rules(_))
        ));
        tmp_dir.close()
    }

    #[test]
    fn test_nix_string() {
        assert_eq!(nix_string("/tmp/a b"), r#""/tmp/a b""#);
        assert_eq!(nix_string(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(nix_string("x${y}$z"), r#""x\${y}$z""#);
    }
}
