use std::fmt;
use std::sync::Arc;

/// Classification result published to the presentation surface.
///
/// Immutable; cloning shares the text.
#[derive(Clone, Debug, PartialEq)]
pub struct Label {
    text: Arc<str>,
    confidence: Option<f32>,
    class_index: Option<usize>,
}

impl Label {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
            class_index: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_class_index(mut self, class_index: usize) -> Self {
        self.class_index = Some(class_index);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn class_index(&self) -> Option<usize> {
        self.class_index
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.confidence {
            Some(confidence) => write!(f, "{} ({:.1}%)", self.text, confidence * 100.0),
            None => f.write_str(&self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_confidence_when_known() {
        assert_eq!(Label::new("tabby").to_string(), "tabby");
        assert_eq!(
            Label::new("tabby").with_confidence(0.875).to_string(),
            "tabby (87.5%)"
        );
    }
}
