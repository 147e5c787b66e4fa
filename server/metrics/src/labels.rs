use std::borrow::Cow;

/// A label value that is safe to export (bounded cardinality).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedLabel(Cow<'static, str>);

impl BoundedLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> Cow<'static, str> {
        self.0
    }
}

const STAGES: &[&str] = &["decode", "transform", "deliver", "deadline"];

/// Failure stage label. Anything outside the known stages collapses to "other"
/// so a new error kind cannot blow up series count.
pub fn stage(stage: &'static str) -> BoundedLabel {
    if STAGES.contains(&stage) {
        BoundedLabel(Cow::Borrowed(stage))
    } else {
        BoundedLabel(Cow::Borrowed("other"))
    }
}

pub fn status(status: &'static str) -> BoundedLabel {
    BoundedLabel(Cow::Borrowed(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_stage_collapses() {
        assert_eq!(stage("deliver").as_str(), "deliver");
        assert_eq!(stage("retry").as_str(), "other");
    }
}
