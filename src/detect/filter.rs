use std::collections::HashSet;

use crate::event::DetectionRecord;

/// Keeps detections of allow-listed classes at or above a minimum confidence.
#[derive(Clone, Debug)]
pub struct SignificanceFilter {
    classes: Vec<String>,
    min_confidence: f64,
}

impl SignificanceFilter {
    pub fn new(classes: Vec<String>, min_confidence: f64) -> Self {
        Self {
            classes,
            min_confidence,
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn is_significant(&self, det: &DetectionRecord) -> bool {
        det.confidence >= self.min_confidence && self.classes.iter().any(|c| *c == det.class_name)
    }

    /// Order-preserving subset of `detections` that passes the filter.
    pub fn apply(&self, detections: &[DetectionRecord]) -> Vec<DetectionRecord> {
        detections
            .iter()
            .filter(|det| self.is_significant(det))
            .cloned()
            .collect()
    }
}

/// Track identifiers that have already triggered an event.
///
/// Owned by exactly one ingestion worker. The set only grows; a fresh filter
/// (worker restart) is the only way to forget an identifier.
#[derive(Clone, Debug, Default)]
pub struct NoveltyFilter {
    seen: HashSet<i64>,
}

impl NoveltyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the detections whose track id has not been seen before and
    /// records those ids. Untracked detections never pass.
    pub fn admit(&mut self, detections: &[DetectionRecord]) -> Vec<DetectionRecord> {
        let mut novel = Vec::new();
        for det in detections {
            let Some(track_id) = det.track_id else {
                continue;
            };
            if self.seen.insert(track_id) {
                novel.push(det.clone());
            }
        }
        novel
    }

    pub fn contains(&self, track_id: i64) -> bool {
        self.seen.contains(&track_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BoundingBox;

    fn det(class: &str, confidence: f64, track: Option<i64>) -> DetectionRecord {
        let d = DetectionRecord::new(class, confidence, BoundingBox::new(0, 0, 10, 10));
        match track {
            Some(id) => d.with_track_id(id),
            None => d,
        }
    }

    #[test]
    fn significance_keeps_allowed_classes_at_threshold_in_order() {
        let filter = SignificanceFilter::new(vec!["person".into(), "car".into()], 0.8);
        let input = vec![
            det("car", 0.95, Some(1)),
            det("person", 0.79, Some(2)),
            det("dog", 0.99, Some(3)),
            det("person", 0.8, Some(4)),
            det("person", 0.91, None),
        ];
        let out = filter.apply(&input);
        assert_eq!(out, vec![input[0].clone(), input[3].clone(), input[4].clone()]);
    }

    #[test]
    fn significance_with_empty_allow_list_keeps_nothing() {
        let filter = SignificanceFilter::new(Vec::new(), 0.0);
        assert!(filter.apply(&[det("person", 1.0, Some(1))]).is_empty());
    }

    #[test]
    fn novelty_admits_each_track_once() {
        let mut novelty = NoveltyFilter::new();
        let first = novelty.admit(&[det("person", 0.9, Some(5)), det("person", 0.9, None)]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].track_id, Some(5));

        let again = novelty.admit(&[det("person", 0.99, Some(5))]);
        assert!(again.is_empty());

        let mixed = novelty.admit(&[det("person", 0.9, Some(5)), det("person", 0.9, Some(6))]);
        assert_eq!(mixed.len(), 1);
        assert_eq!(mixed[0].track_id, Some(6));
        assert!(novelty.contains(5) && novelty.contains(6));
        assert_eq!(novelty.len(), 2);
    }

    #[test]
    fn novelty_deduplicates_within_a_single_frame() {
        let mut novelty = NoveltyFilter::new();
        let out = novelty.admit(&[det("person", 0.9, Some(8)), det("person", 0.9, Some(8))]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn separate_filters_do_not_share_state() {
        let mut a = NoveltyFilter::new();
        let mut b = NoveltyFilter::new();
        assert_eq!(a.admit(&[det("person", 0.9, Some(1))]).len(), 1);
        assert_eq!(b.admit(&[det("person", 0.9, Some(1))]).len(), 1);
    }
}
