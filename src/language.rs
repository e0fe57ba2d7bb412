//! Lyrics language detection backed by `whatlang`.
//!
//! Detection is a pure trigram model, so the same text always yields the
//! same code across runs.

use whatlang::Detector;

use crate::lookup::{LanguageDetector, LookupError};

pub struct TrigramDetector {
    detector: Detector,
    min_confidence: f64,
}

impl TrigramDetector {
    pub fn new() -> Self {
        Self {
            detector: Detector::new(),
            min_confidence: 0.0,
        }
    }

    /// Detections below `min_confidence` are reported as unknown. Confidence
    /// is in 0.0..=1.0, so anything above 1.0 rejects every detection.
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }
}

impl Default for TrigramDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageDetector for TrigramDetector {
    fn detect(&self, text: &str) -> Result<Option<String>, LookupError> {
        let Some(info) = self.detector.detect(text) else {
            return Ok(None);
        };
        if info.confidence() < self.min_confidence {
            return Ok(None);
        }
        Ok(Some(info.lang().code().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGLISH: &str = "I have been walking down this lonely road for so long, \
        and every night I dream about the days when we were young and free";
    const SPANISH: &str = "Quiero que sepas que siempre voy a estar contigo, \
        aunque la noche sea larga y el camino se haga muy difícil";

    #[test]
    fn test_detects_common_languages() {
        let detector = TrigramDetector::new();
        assert_eq!(detector.detect(ENGLISH).unwrap().as_deref(), Some("eng"));
        assert_eq!(detector.detect(SPANISH).unwrap().as_deref(), Some("spa"));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = TrigramDetector::new();
        let first = detector.detect(SPANISH).unwrap();
        for _ in 0..5 {
            assert_eq!(detector.detect(SPANISH).unwrap(), first);
        }
    }

    #[test]
    fn test_no_letters_is_unknown() {
        let detector = TrigramDetector::new();
        assert_eq!(detector.detect("1234 5678 !!!").unwrap(), None);
    }

    #[test]
    fn test_confidence_threshold() {
        let strict = TrigramDetector::new().with_min_confidence(1.1);
        assert_eq!(strict.detect(ENGLISH).unwrap(), None);
    }
}
