//! Structured parameter paths (`model.layer1.conv1.weight`).

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hierarchical parameter identifier, one segment per module level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParamPath(Vec<String>);

impl ParamPath {
    /// Build from segments; every segment must be non-empty and dot-free.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, MlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(MlError::invalid_input("parameter path has no segments"));
        }
        if let Some(bad) = segments.iter().find(|s| s.is_empty() || s.contains('.')) {
            return Err(MlError::invalid_input(format!(
                "invalid parameter path segment '{bad}'"
            )));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a segment. Numeric stage indices are passed through `to_string()`.
    pub fn child(&self, segment: impl ToString) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// True when `prefix` matches this path segment by segment.
    pub fn starts_with(&self, prefix: &ParamPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Remove a leading prefix. `None` when the prefix does not match or would
    /// consume the whole path.
    pub fn strip_prefix(&self, prefix: &ParamPath) -> Option<ParamPath> {
        if self.starts_with(prefix) && self.0.len() > prefix.0.len() {
            Some(Self(self.0[prefix.0.len()..].to_vec()))
        } else {
            None
        }
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for ParamPath {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_segments(s.split('.'))
    }
}

impl TryFrom<String> for ParamPath {
    type Error = MlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParamPath> for String {
    fn from(path: ParamPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ParamPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let p = path("model.layer1.conv1.weight");
        assert_eq!(p.len(), 4);
        assert_eq!(p.segments()[0], "model");
        assert_eq!(p.to_string(), "model.layer1.conv1.weight");
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!("model..weight".parse::<ParamPath>().is_err());
        assert!("".parse::<ParamPath>().is_err());
        assert!(".weight".parse::<ParamPath>().is_err());
    }

    #[test]
    fn test_strip_prefix_is_segment_aware() {
        let p = path("model.layer1.conv1.weight");
        assert_eq!(p.strip_prefix(&path("model")), Some(path("layer1.conv1.weight")));

        // `models` is not the `model` segment.
        let p = path("models.layer1.weight");
        assert_eq!(p.strip_prefix(&path("model")), None);

        // Inner occurrences are untouched.
        let p = path("encoder.model.0.weight");
        assert_eq!(p.strip_prefix(&path("model")), None);

        // A prefix that would leave nothing does not strip.
        assert_eq!(path("model").strip_prefix(&path("model")), None);
    }

    #[test]
    fn test_child() {
        let p = path("encoder").child(3).child("conv");
        assert_eq!(p.to_string(), "encoder.3.conv");
    }

    #[test]
    fn test_serde_as_string() {
        let p = path("loss_function.pos_weight");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"loss_function.pos_weight\"");
        let back: ParamPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
