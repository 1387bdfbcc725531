//! Template-length statistics.
//!
//! The empirically learned insert-size model of one library: the dominant
//! pair orientation plus the accepted template-length window. The template
//! builder classifies candidate pairs against it and the shadow aligner
//! derives its rescue window from it.

use serde::{Deserialize, Serialize};

/// Relative orientation of the leftmost and rightmost reads of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairOrientation {
    /// forward leftmost, reverse rightmost (standard paired-end)
    Fr,
    /// reverse leftmost, forward rightmost (mate-pair style)
    Rf,
    /// both forward
    Ff,
    /// both reverse
    Rr,
}

/// Where a template length falls relative to the learned window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateClass {
    Nominal,
    Undersized,
    Oversized,
    /// orientation does not match the model (or different contigs)
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateLengthStatistics {
    pub min: u32,
    pub max: u32,
    pub median: u32,
    pub low_std_dev: u32,
    pub high_std_dev: u32,
    pub orientation: PairOrientation,
    /// False until enough templates agreed during learning; rescue is
    /// impossible against an incoherent model.
    pub coherent: bool,
}

/// The geometry of one aligned end, as the model sees it.
#[derive(Debug, Clone, Copy)]
pub struct EndGeometry {
    pub contig_id: u32,
    /// f-strand (leftmost) position
    pub begin: i64,
    /// position one past the last aligned base
    pub end: i64,
    pub reverse: bool,
}

impl TemplateLengthStatistics {
    pub fn nominal(median: u32, std_dev: u32) -> Self {
        TemplateLengthStatistics {
            min: median.saturating_sub(3 * std_dev),
            max: median + 3 * std_dev,
            median,
            low_std_dev: std_dev,
            high_std_dev: std_dev,
            orientation: PairOrientation::Fr,
            coherent: true,
        }
    }

    /// Observed template length: bases from the leftmost to the rightmost
    /// mapped base, inclusive.
    pub fn template_length(a: &EndGeometry, b: &EndGeometry) -> i64 {
        a.end.max(b.end) - a.begin.min(b.begin)
    }

    fn pair_orientation(a: &EndGeometry, b: &EndGeometry) -> PairOrientation {
        let (left, right) = if a.begin <= b.begin { (a, b) } else { (b, a) };
        match (left.reverse, right.reverse) {
            (false, true) => PairOrientation::Fr,
            (true, false) => PairOrientation::Rf,
            (false, false) => PairOrientation::Ff,
            (true, true) => PairOrientation::Rr,
        }
    }

    /// True when the pair matches the model: same contig, expected
    /// orientation, length inside the window.
    pub fn matches_model(&self, a: &EndGeometry, b: &EndGeometry) -> bool {
        self.check_model(a, b) == TemplateClass::Nominal
    }

    pub fn check_model(&self, a: &EndGeometry, b: &EndGeometry) -> TemplateClass {
        if a.contig_id != b.contig_id || Self::pair_orientation(a, b) != self.orientation {
            return TemplateClass::Orphaned;
        }
        let length = Self::template_length(a, b);
        if length < self.min as i64 {
            TemplateClass::Undersized
        } else if length > self.max as i64 {
            TemplateClass::Oversized
        } else {
            TemplateClass::Nominal
        }
    }

    /// Expected strand of the mate of a read aligned with `reverse`.
    pub fn mate_orientation(&self, reverse: bool) -> bool {
        match self.orientation {
            PairOrientation::Fr | PairOrientation::Rf => !reverse,
            PairOrientation::Ff | PairOrientation::Rr => reverse,
        }
    }

    /// Smallest begin position the mate of the given orphan can have while
    /// the template stays inside the model window.
    pub fn mate_min_position(&self, orphan: &EndGeometry, mate_read_length: u32) -> i64 {
        if orphan.reverse {
            orphan.end - self.max as i64
        } else {
            orphan.begin + self.min as i64 - mate_read_length as i64
        }
    }

    /// Largest begin position the mate of the given orphan can have.
    pub fn mate_max_position(&self, orphan: &EndGeometry, mate_read_length: u32) -> i64 {
        if orphan.reverse {
            orphan.end - self.min as i64
        } else {
            orphan.begin + self.max as i64 - mate_read_length as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end(begin: i64, len: i64, reverse: bool) -> EndGeometry {
        EndGeometry {
            contig_id: 0,
            begin,
            end: begin + len,
            reverse,
        }
    }

    fn tls() -> TemplateLengthStatistics {
        TemplateLengthStatistics::nominal(300, 30)
    }

    #[test]
    fn nominal_window() {
        let tls = tls();
        assert_eq!(tls.min, 210);
        assert_eq!(tls.max, 390);
    }

    #[test]
    fn fr_pair_in_window_is_nominal() {
        let tls = tls();
        let r1 = end(1000, 100, false);
        let r2 = end(1200, 100, true);
        assert_eq!(TemplateLengthStatistics::template_length(&r1, &r2), 300);
        assert_eq!(tls.check_model(&r1, &r2), TemplateClass::Nominal);
        assert!(tls.matches_model(&r2, &r1)); // argument order is immaterial
    }

    #[test]
    fn wrong_orientation_is_orphaned() {
        let tls = tls();
        let r1 = end(1000, 100, true);
        let r2 = end(1200, 100, false);
        assert_eq!(tls.check_model(&r1, &r2), TemplateClass::Orphaned);
    }

    #[test]
    fn size_classes() {
        let tls = tls();
        let r1 = end(1000, 100, false);
        assert_eq!(
            tls.check_model(&r1, &end(1050, 100, true)),
            TemplateClass::Undersized
        );
        assert_eq!(
            tls.check_model(&r1, &end(1500, 100, true)),
            TemplateClass::Oversized
        );
    }

    #[test]
    fn mate_window_for_forward_orphan() {
        let tls = tls();
        let orphan = end(1_000_000, 100, false);
        let min = tls.mate_min_position(&orphan, 100);
        let max = tls.mate_max_position(&orphan, 100);
        // S3 scenario: unique mate occurrence at 1_000_260 with tlen 300+/-90
        assert!(min <= 1_000_260 && 1_000_260 <= max);
        assert_eq!(min, 1_000_000 + 210 - 100);
        assert_eq!(max, 1_000_000 + 390 - 100);
    }

    #[test]
    fn mate_window_for_reverse_orphan() {
        let tls = tls();
        let orphan = end(1_000_200, 100, true);
        let min = tls.mate_min_position(&orphan, 100);
        let max = tls.mate_max_position(&orphan, 100);
        assert_eq!(min, 1_000_300 - 390);
        assert_eq!(max, 1_000_300 - 210);
        assert!(min < max);
    }

    #[test]
    fn mate_orientation_follows_model() {
        let tls = tls();
        assert!(tls.mate_orientation(false));
        assert!(!tls.mate_orientation(true));
    }
}
