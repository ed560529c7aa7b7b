//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Header set selection: which top-level headers make up the API surface of a Postgres
//! major version.
//!
//! Each version is described by a manifest, `include/pgNN.h`, which is itself a valid C
//! header consisting only of `#include` lines.  The manifests shipped with this crate are
//! compiled in; more can be layered on from a directory, but a manifest can only ever add
//! a version, never redefine one.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const BUILTIN_MANIFESTS: &[(u16, &str)] = &[
    (12, include_str!("../include/pg12.h")),
    (13, include_str!("../include/pg13.h")),
    (14, include_str!("../include/pg14.h")),
    (15, include_str!("../include/pg15.h")),
    (16, include_str!("../include/pg16.h")),
    (17, include_str!("../include/pg17.h")),
];

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("Postgres {0} is not supported; known versions are {1}")]
    UnsupportedVersion(String, String),
    #[error("manifest for pg{version}, line {line}: {reason}")]
    Manifest { version: u16, line: usize, reason: String },
    #[error("pg{0} is already defined and cannot be redefined by `{1}`")]
    Redefined(u16, PathBuf),
    #[error("cannot read manifest `{0}`")]
    Io(PathBuf, #[source] std::io::Error),
}

/// The ordered list of top-level headers for one major version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedHeaderSet {
    version: u16,
    headers: Vec<String>,
}

impl VersionedHeaderSet {
    pub fn new(version: u16, headers: Vec<String>) -> Self {
        VersionedHeaderSet { version, headers }
    }

    /// Parse a manifest.  Only `#include "x"` and `#include <x>` are accepted, plus C
    /// comments and blank lines.  Order is preserved and a header may appear once.
    pub fn parse(version: u16, manifest: &str) -> Result<Self, SelectError> {
        let err = |line: usize, reason: String| SelectError::Manifest { version, line, reason };
        let mut headers = Vec::new();
        let mut seen = BTreeSet::new();
        let mut in_comment = false;

        for (idx, raw) in manifest.lines().enumerate() {
            let lineno = idx + 1;
            let line = strip_comments(raw, &mut in_comment);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(rest) = line.strip_prefix('#') else {
                return Err(err(lineno, format!("expected an `#include`, found `{line}`")));
            };
            let Some(target) = rest.trim_start().strip_prefix("include") else {
                return Err(err(lineno, format!("only `#include` directives are allowed: `{line}`")));
            };
            let target = target.trim();
            let header = match (target.chars().next(), target.chars().last()) {
                (Some('"'), Some('"')) | (Some('<'), Some('>')) if target.len() > 2 => {
                    &target[1..target.len() - 1]
                }
                _ => return Err(err(lineno, format!("malformed include target `{target}`"))),
            };
            if !seen.insert(header.to_string()) {
                return Err(err(lineno, format!("`{header}` is included twice")));
            }
            headers.push(header.to_string());
        }

        if headers.is_empty() {
            return Err(err(0, "manifest includes no headers".into()));
        }
        Ok(VersionedHeaderSet { version, headers })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// The in-memory umbrella translation unit handed to the parser.
    pub fn umbrella_source(&self) -> String {
        let mut src = String::new();
        for header in &self.headers {
            src.push_str(&format!("#include \"{header}\"\n"));
        }
        src
    }
}

fn strip_comments(line: &str, in_comment: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    loop {
        if *in_comment {
            match rest.find("*/") {
                Some(end) => {
                    *in_comment = false;
                    rest = &rest[end + 2..];
                }
                None => return out,
            }
        } else {
            let block = rest.find("/*");
            let eol = rest.find("//");
            match (block, eol) {
                (Some(b), Some(l)) if l < b => {
                    out.push_str(&rest[..l]);
                    return out;
                }
                (Some(b), _) => {
                    out.push_str(&rest[..b]);
                    *in_comment = true;
                    rest = &rest[b + 2..];
                }
                (None, Some(l)) => {
                    out.push_str(&rest[..l]);
                    return out;
                }
                (None, None) => {
                    out.push_str(rest);
                    return out;
                }
            }
        }
    }
}

/// Every header set the generator knows about.  Built once, then only read.
#[derive(Clone, Debug, Default)]
pub struct HeaderSetRegistry {
    sets: BTreeMap<u16, VersionedHeaderSet>,
}

impl HeaderSetRegistry {
    /// The sets compiled into this crate.
    pub fn builtin() -> Result<Self, SelectError> {
        let mut sets = BTreeMap::new();
        for (version, manifest) in BUILTIN_MANIFESTS {
            sets.insert(*version, VersionedHeaderSet::parse(*version, manifest)?);
        }
        Ok(HeaderSetRegistry { sets })
    }

    pub fn from_sets(sets: impl IntoIterator<Item = VersionedHeaderSet>) -> Self {
        HeaderSetRegistry { sets: sets.into_iter().map(|s| (s.version, s)).collect() }
    }

    /// Returns a new registry with one more set.  An existing version is never replaced.
    pub fn with_set(&self, set: VersionedHeaderSet, origin: &Path) -> Result<Self, SelectError> {
        if self.sets.contains_key(&set.version) {
            return Err(SelectError::Redefined(set.version, origin.to_path_buf()));
        }
        let mut sets = self.sets.clone();
        sets.insert(set.version, set);
        Ok(HeaderSetRegistry { sets })
    }

    /// Layers every `pgNN.h` found under `dir` on top of this registry.
    pub fn with_manifest_dir(&self, dir: &Path) -> Result<Self, SelectError> {
        let mut registry = self.clone();
        let entries = walkdir::WalkDir::new(dir).sort_by_file_name().into_iter();
        for entry in entries {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                SelectError::Io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(version) = manifest_version(entry.path()) else {
                continue;
            };
            let contents = std::fs::read_to_string(entry.path())
                .map_err(|e| SelectError::Io(entry.path().to_path_buf(), e))?;
            let set = VersionedHeaderSet::parse(version, &contents)?;
            tracing::debug!(version, manifest = %entry.path().display(), "loaded header set");
            registry = registry.with_set(set, entry.path())?;
        }
        Ok(registry)
    }

    /// Looks up the set for `version`, which may be spelled `16`, `pg16` or `PG16`.
    pub fn select(&self, version: &str) -> Result<&VersionedHeaderSet, SelectError> {
        pgffi_pg_config::parse_major_version(version)
            .and_then(|major| self.sets.get(&major))
            .ok_or_else(|| SelectError::UnsupportedVersion(version.to_string(), self.describe()))
    }

    pub fn get(&self, version: u16) -> Result<&VersionedHeaderSet, SelectError> {
        self.sets
            .get(&version)
            .ok_or_else(|| SelectError::UnsupportedVersion(format!("pg{version}"), self.describe()))
    }

    pub fn versions(&self) -> impl Iterator<Item = u16> + '_ {
        self.sets.keys().copied()
    }

    fn describe(&self) -> String {
        self.sets.keys().map(|v| format!("pg{v}")).collect::<Vec<_>>().join(", ")
    }
}

/// `pg16.h` -> 16
fn manifest_version(path: &Path) -> Option<u16> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".h")?;
    let digits = stem.strip_prefix("pg")?;
    pgffi_pg_config::parse_major_version(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_sets_cover_supported_versions() {
        let registry = HeaderSetRegistry::builtin().unwrap();
        let versions = registry.versions().collect::<Vec<_>>();
        assert_eq!(versions, pgffi_pg_config::SUPPORTED_VERSIONS);
        for v in versions {
            let set = registry.get(v).unwrap();
            assert_eq!(set.headers()[0], "postgres.h", "pg{v} must include postgres.h first");
        }
    }

    #[test]
    fn newer_versions_only_add_headers() {
        let registry = HeaderSetRegistry::builtin().unwrap();
        assert!(!registry.get(12).unwrap().headers().iter().any(|h| h == "access/detoast.h"));
        assert!(registry.get(13).unwrap().headers().iter().any(|h| h == "access/detoast.h"));
        assert!(registry.get(16).unwrap().headers().iter().any(|h| h == "varatt.h"));
        assert!(!registry.get(15).unwrap().headers().iter().any(|h| h == "varatt.h"));
    }

    #[test]
    fn select_accepts_labels() {
        let registry = HeaderSetRegistry::builtin().unwrap();
        assert_eq!(registry.select("pg14").unwrap().version(), 14);
        assert_eq!(registry.select("PG14").unwrap().version(), 14);
        assert_eq!(registry.select("14").unwrap().version(), 14);
        assert!(matches!(registry.select("pg9"), Err(SelectError::UnsupportedVersion(v, _)) if v == "pg9"));
        assert!(matches!(registry.select("banana"), Err(SelectError::UnsupportedVersion(..))));
    }

    #[test]
    fn parse_manifest() {
        let manifest = r#"
/*
 * a header set
 */
#include "postgres.h"   // always first
#include <fmgr.h>

# include "access/htup.h" /* trailing */
"#;
        let set = VersionedHeaderSet::parse(99, manifest).unwrap();
        assert_eq!(set.headers(), ["postgres.h", "fmgr.h", "access/htup.h"]);
        assert_eq!(
            set.umbrella_source(),
            "#include \"postgres.h\"\n#include \"fmgr.h\"\n#include \"access/htup.h\"\n"
        );
    }

    #[test]
    fn parse_manifest_rejects_other_lines() {
        let err = VersionedHeaderSet::parse(99, "#include \"a.h\"\n#define X 1\n").unwrap_err();
        assert!(matches!(err, SelectError::Manifest { line: 2, .. }));
        let err = VersionedHeaderSet::parse(99, "#include \"a.h\"\n#include <a.h>\n").unwrap_err();
        assert!(matches!(err, SelectError::Manifest { line: 2, .. }));
        let err = VersionedHeaderSet::parse(99, "#include a.h\n").unwrap_err();
        assert!(matches!(err, SelectError::Manifest { line: 1, .. }));
        assert!(VersionedHeaderSet::parse(99, "/* nothing */\n").is_err());
    }

    #[test]
    fn manifest_dir_adds_but_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pg99.h"), "#include \"postgres.h\"\n").unwrap();
        std::fs::write(dir.path().join("README"), "not a manifest").unwrap();

        let base = HeaderSetRegistry::builtin().unwrap();
        let extended = base.with_manifest_dir(dir.path()).unwrap();
        assert_eq!(extended.get(99).unwrap().headers(), ["postgres.h"]);
        assert_eq!(extended.get(14).unwrap(), base.get(14).unwrap());
        assert!(base.get(99).is_err());

        std::fs::write(dir.path().join("pg14.h"), "#include \"postgres.h\"\n").unwrap();
        let err = base.with_manifest_dir(dir.path()).unwrap_err();
        assert!(matches!(err, SelectError::Redefined(14, _)));
    }
}
