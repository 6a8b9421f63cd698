use crate::error::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Merged capture groups of every level on the way to a path.
pub type GroupDict = BTreeMap<String, String>;

/// Ordered hierarchy levels, e.g. `year/experiment/subentry`.
///
/// Deserializes from either `"./year/experiment/subentry"` or
/// `["year", "experiment", "subentry"]`. Leading `.` and empty segments are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SchemeSpec", into = "String")]
pub struct FolderScheme {
    levels: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemeSpec {
    Path(String),
    Levels(Vec<String>),
}

impl From<SchemeSpec> for FolderScheme {
    fn from(spec: SchemeSpec) -> Self {
        match spec {
            SchemeSpec::Path(path) => FolderScheme::parse(&path),
            SchemeSpec::Levels(levels) => FolderScheme::from_levels(levels),
        }
    }
}

impl From<FolderScheme> for String {
    fn from(scheme: FolderScheme) -> Self {
        scheme.to_string()
    }
}

impl FolderScheme {
    pub fn parse(scheme: &str) -> Self {
        Self::from_levels(scheme.split('/').map(str::to_string))
    }

    pub fn from_levels<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels = levels
            .into_iter()
            .map(Into::into)
            .map(|level: String| level.trim().to_string())
            .filter(|level| !level.is_empty() && level != ".")
            .collect();
        Self { levels }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn contains(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }

    /// Truncate the scheme so that `rightmost` is its last level.
    pub fn up_to(&self, rightmost: &str) -> Result<FolderScheme, Error> {
        let idx = self
            .levels
            .iter()
            .position(|l| l == rightmost)
            .ok_or_else(|| Error::UnknownLevel {
                level: rightmost.to_string(),
                scheme: self.to_string(),
            })?;
        Ok(Self {
            levels: self.levels[..=idx].to_vec(),
        })
    }
}

impl fmt::Display for FolderScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "./{}", self.levels.join("/"))
    }
}

/// A successful match of one directory name against one level pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMatch {
    pub level: String,
    pub text: String,
    pub groups: GroupDict,
}

/// Compiled per-level patterns. Matching is anchored at the start of the
/// directory name, not at its end.
#[derive(Debug, Clone, Default)]
pub struct LevelPatterns {
    patterns: BTreeMap<String, (String, Regex)>,
}

impl LevelPatterns {
    pub fn compile(sources: &BTreeMap<String, String>) -> Result<Self, Error> {
        let mut patterns = Self::default();
        for (level, source) in sources {
            patterns.insert(level, source)?;
        }
        Ok(patterns)
    }

    pub fn insert(&mut self, level: &str, source: &str) -> Result<(), Error> {
        let regex = Regex::new(&format!(r"\A(?:{})", source)).map_err(|e| {
            Error::InvalidPattern {
                level: level.to_string(),
                source: e,
            }
        })?;
        self.patterns
            .insert(level.to_string(), (source.to_string(), regex));
        Ok(())
    }

    pub fn get(&self, level: &str) -> Option<&Regex> {
        self.patterns.get(level).map(|(_, regex)| regex)
    }

    pub fn source(&self, level: &str) -> Option<&str> {
        self.patterns.get(level).map(|(source, _)| source.as_str())
    }

    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    /// Every level of `scheme` must have a pattern.
    pub fn require(&self, scheme: &FolderScheme) -> Result<(), Error> {
        match scheme.levels().iter().find(|l| !self.patterns.contains_key(*l)) {
            Some(missing) => Err(Error::MissingLevelPattern(missing.clone())),
            None => Ok(()),
        }
    }

    pub fn match_name(&self, level: &str, name: &str) -> Option<LevelMatch> {
        let regex = self.get(level)?;
        let caps = regex.captures(name)?;
        let groups = regex
            .capture_names()
            .flatten()
            .filter_map(|group| {
                caps.name(group)
                    .map(|m| (group.to_string(), m.as_str().to_string()))
            })
            .collect();
        Some(LevelMatch {
            level: level.to_string(),
            text: caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string(),
            groups,
        })
    }
}
