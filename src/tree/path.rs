use serde::{Deserialize, Serialize};
use std::fmt;

const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];
const MAX_SEGMENT_LEN: usize = 768;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Path contains an empty segment")]
    EmptySegment,

    #[error("Path segment contains forbidden character {0:?}")]
    ForbiddenChar(char),

    #[error("Path segment is too long")]
    SegmentTooLong,
}

/// Normalized slash-delimited location in the data tree. The empty path is
/// the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataPath(String);

impl DataPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        for segment in trimmed.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn child(&self, key: &str) -> Result<Self, PathError> {
        validate_segment(key)?;
        if self.is_root() {
            Ok(Self(key.to_string()))
        } else {
            Ok(Self(format!("{}/{}", self.0, key)))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, `None` for the root.
    pub fn key(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Proper, non-root ancestors from the shortest to the longest.
    pub fn ancestors(&self) -> Vec<DataPath> {
        self.0
            .char_indices()
            .filter(|(_, c)| *c == '/')
            .map(|(i, _)| DataPath(self.0[..i].to_string()))
            .collect()
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &DataPath) -> bool {
        if self.is_root() || self.0 == other.0 {
            return true;
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Whether a write at one path can change what is visible at the other.
    pub fn overlaps(&self, other: &DataPath) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Segments of `self` below `ancestor`. Empty when they are equal.
    pub fn relative_to(&self, ancestor: &DataPath) -> Vec<String> {
        let skip = ancestor.segments().count();
        self.segments().skip(skip).map(str::to_string).collect()
    }
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(PathError::SegmentTooLong);
    }
    if let Some(c) = segment
        .chars()
        .find(|c| FORBIDDEN.contains(c) || c.is_control() || *c == '/')
    {
        return Err(PathError::ForbiddenChar(c));
    }
    Ok(())
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl TryFrom<String> for DataPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DataPath::parse(&value)
    }
}

impl From<DataPath> for String {
    fn from(path: DataPath) -> Self {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> DataPath {
        DataPath::parse(raw).unwrap()
    }

    #[test]
    fn parse_trims_slashes() {
        assert_eq!(p("/events/abc/").as_str(), "events/abc");
        assert!(p("/").is_root());
        assert!(p("").is_root());
    }

    #[test]
    fn parse_rejects_bad_segments() {
        assert_eq!(DataPath::parse("events//x"), Err(PathError::EmptySegment));
        assert_eq!(
            DataPath::parse("events/a.b"),
            Err(PathError::ForbiddenChar('.'))
        );
        assert_eq!(
            DataPath::parse("users/$uid"),
            Err(PathError::ForbiddenChar('$'))
        );
        assert!(DataPath::parse("a\nb").is_err());
    }

    #[test]
    fn child_appends_segment() {
        assert_eq!(DataPath::root().child("events").unwrap().as_str(), "events");
        assert_eq!(p("events").child("e1").unwrap().as_str(), "events/e1");
        assert!(p("events").child("a/b").is_err());
    }

    #[test]
    fn ancestors_are_shortest_first() {
        let ancestors: Vec<String> = p("a/b/c")
            .ancestors()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ancestors, vec!["a", "a/b"]);
        assert!(p("a").ancestors().is_empty());
    }

    #[test]
    fn contains_respects_segment_boundaries() {
        assert!(p("events").contains(&p("events/e1")));
        assert!(p("events").contains(&p("events")));
        assert!(!p("events").contains(&p("eventsX/e1")));
        assert!(!p("events/e1").contains(&p("events")));
        assert!(DataPath::root().contains(&p("anything")));
    }

    #[test]
    fn overlaps_is_symmetric() {
        assert!(p("events/e1").overlaps(&p("events")));
        assert!(p("events").overlaps(&p("events/e1/title")));
        assert!(!p("events/e1").overlaps(&p("events/e2")));
    }

    #[test]
    fn relative_segments() {
        assert_eq!(p("a/b/c").relative_to(&p("a")), vec!["b", "c"]);
        assert!(p("a").relative_to(&p("a")).is_empty());
    }

    #[test]
    fn key_and_display() {
        assert_eq!(p("events/e1").key(), Some("e1"));
        assert_eq!(DataPath::root().key(), None);
        assert_eq!(p("events/e1").to_string(), "/events/e1");
    }
}
