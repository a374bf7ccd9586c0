use glob::{MatchOptions, Pattern};
use std::path::Path;
use tracing::{debug, warn};

/// Ignore files read from the project root, in gitignore syntax
pub const IGNORE_FILES: &[&str] = &[".gitignore", ".tandemignore"];

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Rule {
    /// No slash in the glob: tested against every path component
    Name(Pattern),
    /// Anchored at the root: tested against the path and each of its parents
    Path(Pattern),
}

/// Paths the file system driver never mirrors
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Self {
        let mut rules = Self::default();
        for glob in globs {
            rules.add(glob.as_ref());
        }
        rules
    }

    /// Configured globs plus the ignore files found at `root`
    pub fn load<S: AsRef<str>>(root: &Path, globs: &[S]) -> Self {
        let mut rules = Self::new(globs);
        for name in IGNORE_FILES {
            let path = root.join(name);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let before = rules.rules.len();
                    for line in content.lines() {
                        rules.add(line);
                    }
                    debug!(file = %path.display(), rules = rules.rules.len() - before, "Loaded ignore file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to read ignore file"),
            }
        }
        rules
    }

    fn add(&mut self, line: &str) {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            return;
        }
        if line.starts_with('!') {
            debug!(rule = line, "Negated ignore rules are not supported, skipping");
            return;
        }
        let glob = line.trim_end_matches('/');
        let (glob, anchored) = match glob.strip_prefix('/') {
            Some(rest) => (rest, true),
            None => (glob, glob.contains('/')),
        };
        match Pattern::new(glob) {
            Ok(pattern) if anchored => self.rules.push(Rule::Path(pattern)),
            Ok(pattern) => self.rules.push(Rule::Name(pattern)),
            Err(e) => warn!(rule = line, error = %e, "Invalid ignore glob"),
        }
    }

    /// Whether the root-relative `rel` (slash separated) is ignored
    pub fn is_ignored(&self, rel: &str) -> bool {
        self.rules.iter().any(|rule| match rule {
            Rule::Name(pattern) => rel.split('/').any(|part| pattern.matches_with(part, MATCH)),
            Rule::Path(pattern) => parents(rel).any(|prefix| pattern.matches_with(prefix, MATCH)),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `a/b/c` yields `a`, `a/b`, `a/b/c`
fn parents(rel: &str) -> impl Iterator<Item = &str> {
    rel.match_indices('/')
        .map(move |(i, _)| &rel[..i])
        .chain(std::iter::once(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::new(&FsConfig::default().ignore);
        assert!(rules.is_ignored(".godot/imported/x.ctex"));
        assert!(rules.is_ignored("scenes/backup.tmp"));
        assert!(rules.is_ignored("notes.txt~"));
        assert!(rules.is_ignored("art/.DS_Store"));
        assert!(!rules.is_ignored("scenes/main.tscn"));
    }

    #[test]
    fn test_nested_globs() {
        let rules = IgnoreRules::new(&[".godot/imported/*"]);
        assert!(rules.is_ignored(".godot/imported/x.ctex"));
        assert!(!rules.is_ignored(".godot/editor/x.cfg"));
        assert!(!rules.is_ignored("other/.godot/imported/x.ctex"));

        let rules = IgnoreRules::new(&["**/*.tmp", "/build/", "addons/*/cache"]);
        assert!(rules.is_ignored("a/b/c.tmp"));
        assert!(rules.is_ignored("build/out/game.pck"));
        assert!(!rules.is_ignored("src/build/notes.txt"));
        assert!(rules.is_ignored("addons/dialogue/cache/index.bin"));
        assert!(!rules.is_ignored("addons/dialogue/plugin.gd"));
    }

    #[test]
    fn test_loads_ignore_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".gitignore"),
            "# exports\nexport/\n\n*.log  # logs\n!keep.log\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".tandemignore"), "secrets/*.key\n").unwrap();

        let rules = IgnoreRules::load(dir.path(), &[] as &[&str]);
        assert_eq!(rules.len(), 3);
        assert!(rules.is_ignored("export/game.exe"));
        assert!(rules.is_ignored("logs/keep.log"));
        assert!(rules.is_ignored("secrets/prod.key"));
        assert!(!rules.is_ignored("secrets/readme.txt"));
    }
}
