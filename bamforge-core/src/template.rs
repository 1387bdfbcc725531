//! Template building: choosing the pair of single-end alignments that best
//! explains one cluster, scoring it against every alternative, and rescuing
//! unaligned mates through the shadow aligner when the seed step left one
//! side empty or the chosen pair looks suspicious.
//!
//! All fragment candidates of one cluster share a single CIGAR arena; the
//! builder appends rescued-shadow CIGARs to the same arena so every fragment
//! of the final template resolves against one buffer.

use log::trace;

use crate::alignment::FragmentMetadata;
use crate::cluster::Cluster;
use crate::quality::{lp_equals, lp_less, rest_of_genome_correction};
use crate::shadow::ShadowAligner;
use crate::tls::{TemplateClass, TemplateLengthStatistics};
use crate::types::Contig;

/// Upper bound on equivalently-best placements tracked for one read.
pub const TRACKED_REPEATS_MAX_ONE_READ: usize = 1000;

/// Score cap for templates that are clean (no edit distance) but anchored
/// too weakly to trust: high enough that downstream callers do not discard
/// the evidence, low enough to flag the doubt.
pub const DODGY_BUT_CLEAN_ALIGNMENT_SCORE: u32 = 10;

/// Orphans this much less probable than the best one are not worth a rescue
/// attempt.
const ORPHAN_LOG_PROBABILITY_SLACK: f64 = 4.605170185988092; // ln(100)

/// When a model pair with this edit-distance margin exists, rescued
/// templates with more edits are ignored.
const SKIP_ORPHAN_EDIT_DISTANCE: u32 = 0;

/// What to emit for a template whose anchoring evidence is too weak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DodgyAlignmentScore {
    /// sort the whole template into the unaligned bin
    Unaligned,
    /// emit with unknown score
    Unknown,
    /// emit with this fixed MAPQ
    Score(u8),
}

impl std::str::FromStr for DodgyAlignmentScore {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, String> {
        match value {
            "Unaligned" => Ok(DodgyAlignmentScore::Unaligned),
            "Unknown" => Ok(DodgyAlignmentScore::Unknown),
            number => number
                .parse::<u8>()
                .map(DodgyAlignmentScore::Score)
                .map_err(|_| format!("invalid dodgy alignment score: {}", value)),
        }
    }
}

/// Rest-of-genome priors, computed once per lane configuration.
#[derive(Debug, Clone)]
pub struct RestOfGenomeCorrection {
    template: f64,
    reads: [f64; 2],
}

impl RestOfGenomeCorrection {
    pub fn new(contigs: &[Contig], read_lengths: [u32; 2]) -> Self {
        let genome_length: u64 = contigs.iter().map(|c| c.len() as u64).sum();
        RestOfGenomeCorrection {
            template: rest_of_genome_correction(
                genome_length,
                read_lengths[0] + read_lengths[1],
            ),
            reads: [
                rest_of_genome_correction(genome_length, read_lengths[0]),
                rest_of_genome_correction(genome_length, read_lengths[1]),
            ],
        }
    }

    pub fn template(&self) -> f64 {
        self.template
    }

    pub fn read(&self, read_index: usize) -> f64 {
        self.reads[read_index]
    }
}

/// The pair of fragments (or single fragment) emitted for one cluster.
pub struct BamTemplate<'a> {
    fragments: Vec<FragmentMetadata<'a>>,
    alignment_score: Option<u32>,
    proper_pair: bool,
}

impl<'a> BamTemplate<'a> {
    pub fn unaligned(cluster: &'a Cluster) -> Self {
        BamTemplate {
            fragments: (0..cluster.read_count())
                .map(|read_index| FragmentMetadata::new(cluster, read_index))
                .collect(),
            alignment_score: None,
            proper_pair: false,
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragment(&self, index: usize) -> &FragmentMetadata<'a> {
        &self.fragments[index]
    }

    pub fn fragment_mut(&mut self, index: usize) -> &mut FragmentMetadata<'a> {
        &mut self.fragments[index]
    }

    pub fn mate_of(&self, read_index: usize) -> &FragmentMetadata<'a> {
        &self.fragments[self.fragments.len() - 1 - read_index]
    }

    pub fn alignment_score(&self) -> Option<u32> {
        self.alignment_score
    }

    pub fn set_alignment_score(&mut self, score: Option<u32>) {
        self.alignment_score = score;
    }

    pub fn is_proper_pair(&self) -> bool {
        self.proper_pair
    }

    pub fn set_proper_pair(&mut self, proper: bool) {
        self.proper_pair = proper;
    }

    pub fn edit_distance(&self) -> u32 {
        self.fragments.iter().map(|f| f.edit_distance).sum()
    }

    pub fn total_read_length(&self) -> u32 {
        self.fragments.iter().map(|f| f.read_length()).sum()
    }

    pub fn quality_sum(&self) -> u32 {
        self.fragments.iter().map(|f| f.quality_sum()).sum()
    }

    /// Collapses fragments scoring below the threshold to unaligned; a
    /// collapsed fragment keeps its mate's position so the pair stays
    /// co-located. Returns true while at least one fragment stays aligned.
    pub fn filter_low_quality_fragments(&mut self, mapq_threshold: u32) -> bool {
        let scores: Vec<Option<u32>> =
            self.fragments.iter().map(|f| f.alignment_score).collect();
        let placements: Vec<(u32, i64, bool)> = self
            .fragments
            .iter()
            .map(|f| (f.contig_id, f.position, f.is_aligned()))
            .collect();
        let mut any_aligned = false;
        for (index, fragment) in self.fragments.iter_mut().enumerate() {
            let below = scores[index].map(|s| s < mapq_threshold).unwrap_or(false);
            if below {
                let mate = placements[placements.len() - 1 - index];
                fragment.set_unaligned();
                if mate.2 {
                    fragment.contig_id = mate.0;
                    fragment.position = mate.1;
                } else {
                    fragment.set_no_match();
                }
            }
            any_aligned |= fragment.is_aligned();
        }
        if !any_aligned {
            for fragment in &mut self.fragments {
                fragment.set_no_match();
            }
        }
        any_aligned
    }
}

#[derive(Default)]
struct BestPairInfo<'a> {
    /// equivalently-best templates, each in read order
    pairs: Vec<[FragmentMetadata<'a>; 2]>,
    best_template_score: u64,
    best_log_probability: f64,
    best_edit_distance: u32,
    total_template_probability: f64,
    resolved_count: u64,
}

impl<'a> BestPairInfo<'a> {
    fn clear(&mut self) {
        self.pairs.clear();
        self.best_template_score = 0;
        self.best_log_probability = f64::MIN;
        self.best_edit_distance = 0;
        self.total_template_probability = 0.0;
        self.resolved_count = 0;
    }

    fn best_template_length(&self) -> i64 {
        self.pairs
            .first()
            .map(|[r1, r2]| {
                TemplateLengthStatistics::template_length(
                    &r1.end_geometry(),
                    &r2.end_geometry(),
                )
            })
            .unwrap_or(0)
    }

    /// Offers one (read1, read2) template; keeps it when it ties or beats
    /// the current best by `(smith-waterman asc, log-probability desc)`.
    fn offer(&mut self, pair: [FragmentMetadata<'a>; 2]) {
        let score = pair[0].smith_waterman_score as u64 + pair[1].smith_waterman_score as u64;
        let log_probability = pair[0].log_probability + pair[1].log_probability;
        self.total_template_probability += log_probability.exp();
        if self.resolved_count == 0
            || score < self.best_template_score
            || (score == self.best_template_score
                && lp_less(self.best_log_probability, log_probability))
        {
            self.pairs.clear();
            self.best_edit_distance = pair[0].edit_distance + pair[1].edit_distance;
            self.pairs.push(pair);
            self.best_template_score = score;
            self.best_log_probability = log_probability;
        } else if score == self.best_template_score
            && lp_equals(log_probability, self.best_log_probability)
            && self.pairs.len() < TRACKED_REPEATS_MAX_ONE_READ
        {
            self.pairs.push(pair);
        }
        self.resolved_count += 1;
    }
}

/// A bad alignment regardless of uniqueness: too few consecutive matches
/// combined with too many mismatches or a hopeless log probability.
fn is_very_bad_alignment(fragment: &FragmentMetadata<'_>, cigar_buffer: &[u32]) -> bool {
    let mapped = fragment.mapped_length(cigar_buffer);
    fragment.matches_in_a_row < 32
        && (fragment.mismatch_count > mapped / 8
            || fragment.log_probability < crate::quality::LOG_MISMATCH_Q40 / 4.0 * mapped as f64)
}

/// Sums `exp(lp)` over candidates, counting each placement once even when
/// several candidate paths reached it.
fn sum_unique_probabilities(candidates: &mut Vec<(u32, i64, bool, u32, f64)>) -> f64 {
    candidates.sort_by(|a, b| {
        (a.0, a.1, a.2, a.3)
            .cmp(&(b.0, b.1, b.2, b.3))
            .then(a.4.partial_cmp(&b.4).unwrap_or(std::cmp::Ordering::Equal))
    });
    candidates.dedup_by_key(|entry| (entry.0, entry.1, entry.2, entry.3));
    candidates.iter().map(|entry| entry.4.exp()).sum()
}

fn phred_from_probabilities(other: f64, total: f64) -> u32 {
    if total <= 0.0 || other <= 0.0 {
        return 60;
    }
    (-10.0 * (other / total).log10()).floor().max(0.0) as u32
}

pub struct TemplateBuilder {
    scatter_repeats: bool,
    dodgy_alignment_score: DodgyAlignmentScore,
    mapq_threshold: u32,
    shadow_aligner: ShadowAligner,
}

impl TemplateBuilder {
    pub fn new(
        scatter_repeats: bool,
        dodgy_alignment_score: DodgyAlignmentScore,
        gapped_mismatches_max: u32,
        mapq_threshold: u32,
    ) -> Self {
        TemplateBuilder {
            scatter_repeats,
            dodgy_alignment_score,
            mapq_threshold,
            shadow_aligner: ShadowAligner::new(gapped_mismatches_max),
        }
    }

    /// Builds the template for one cluster from its candidate lists and
    /// applies the MAPQ-threshold filter. The boolean is false when the
    /// cluster must be treated as unaligned.
    pub fn build_template<'a>(
        &mut self,
        contigs: &[Contig],
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        cigar_buffer: &mut Vec<u32>,
    ) -> (BamTemplate<'a>, bool) {
        let (mut template, mut aligned) =
            self.build_unfiltered(contigs, rog, cluster, candidates, tls, cigar_buffer);

        if aligned && template.alignment_score().is_some() {
            if !template.is_proper_pair() {
                aligned = template.filter_low_quality_fragments(self.mapq_threshold);
            } else if self.mapq_threshold > template.alignment_score().unwrap_or(0) {
                template.filter_low_quality_fragments(u32::MAX);
                aligned = false;
            }
        }
        (template, aligned)
    }

    fn build_unfiltered<'a>(
        &mut self,
        contigs: &[Contig],
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        cigar_buffer: &mut Vec<u32>,
    ) -> (BamTemplate<'a>, bool) {
        if cluster.read_count() == 2 {
            match (candidates[0].is_empty(), candidates[1].is_empty()) {
                (false, false) => {
                    self.pick_best_pair(contigs, rog, cluster, candidates, tls, cigar_buffer)
                }
                (true, true) => (BamTemplate::unaligned(cluster), false),
                _ => self
                    .rescue_shadow_template(contigs, rog, cluster, candidates, tls, cigar_buffer),
            }
        } else if !candidates[0].is_empty() {
            self.pick_best_fragment(rog, cluster, &candidates[0], cigar_buffer)
        } else {
            (BamTemplate::unaligned(cluster), false)
        }
    }

    /// Best single candidate by `(smith-waterman asc, log-probability
    /// desc)`; ties are scattered by cluster id when enabled.
    fn best_fragment_indexes(&self, list: &[FragmentMetadata<'_>]) -> Vec<usize> {
        let mut best: Vec<usize> = Vec::new();
        let mut best_score = u32::MAX;
        let mut best_lp = f64::MIN;
        for (at, fragment) in list.iter().enumerate() {
            if best.is_empty()
                || best_score > fragment.smith_waterman_score
                || (best_score == fragment.smith_waterman_score
                    && lp_less(best_lp, fragment.log_probability))
            {
                best_score = fragment.smith_waterman_score;
                best_lp = fragment.log_probability;
                best.clear();
                best.push(at);
            } else if best_score == fragment.smith_waterman_score
                && lp_equals(best_lp, fragment.log_probability)
                && best.len() < TRACKED_REPEATS_MAX_ONE_READ
            {
                best.push(at);
            }
        }
        best
    }

    fn scatter_index(&self, cluster_id: u64, count: usize) -> usize {
        if self.scatter_repeats && count > 1 {
            (cluster_id % count as u64) as usize
        } else {
            0
        }
    }

    /// Computes the anchored alignment score of `fragment` against its
    /// candidate list. Returns false (score zero) when nothing anchors the
    /// placement.
    fn update_mapping_score(
        &self,
        fragment: &mut FragmentMetadata<'_>,
        rog: &RestOfGenomeCorrection,
        list: &[FragmentMetadata<'_>],
        force_well_anchored: bool,
    ) -> bool {
        if !(force_well_anchored || fragment.is_well_anchored()) {
            // all seeds have neighbors and no two of them agree
            fragment.alignment_score = Some(0);
            return false;
        }
        let own = fragment.placement();
        let mut neighbor_probability = rog.read(fragment.read_index);
        for candidate in list {
            if candidate.placement() != own {
                neighbor_probability += candidate.log_probability.exp();
            }
        }
        let total = neighbor_probability + fragment.log_probability.exp();
        fragment.alignment_score = Some(phred_from_probabilities(neighbor_probability, total));
        true
    }

    fn flag_dodgy_template(&self, template: &mut BamTemplate<'_>) -> bool {
        template.set_alignment_score(None);
        match self.dodgy_alignment_score {
            DodgyAlignmentScore::Unaligned => {
                // both must sort into the unaligned bin
                for index in 0..template.fragment_count() {
                    template.fragment_mut(index).set_no_match();
                }
                false
            }
            // unknown or numeric: the BAM generator maps the sentinel later
            DodgyAlignmentScore::Unknown | DodgyAlignmentScore::Score(_) => {
                for index in 0..template.fragment_count() {
                    template.fragment_mut(index).alignment_score = None;
                }
                true
            }
        }
    }

    fn pick_best_fragment<'a>(
        &mut self,
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        list: &[FragmentMetadata<'a>],
        _cigar_buffer: &mut Vec<u32>,
    ) -> (BamTemplate<'a>, bool) {
        let best = self.best_fragment_indexes(list);
        let chosen = best[self.scatter_index(cluster.id, best.len())];
        let mut template = BamTemplate::unaligned(cluster);
        *template.fragment_mut(0) = list[chosen].clone();
        if !self.update_mapping_score(template.fragment_mut(0), rog, list, false) {
            let aligned = self.flag_dodgy_template(&mut template);
            (template, aligned)
        } else {
            let score = template.fragment(0).alignment_score;
            template.set_alignment_score(score);
            (template, true)
        }
    }

    fn locate_best_pair<'a>(
        &self,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        best: &mut BestPairInfo<'a>,
    ) {
        best.clear();
        for read1 in &candidates[0] {
            for read2 in &candidates[1] {
                if read1.contig_id != read2.contig_id {
                    continue;
                }
                if tls.matches_model(&read1.end_geometry(), &read2.end_geometry()) {
                    best.offer([read1.clone(), read2.clone()]);
                }
            }
        }
    }

    fn pick_best_pair<'a>(
        &mut self,
        contigs: &[Contig],
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        cigar_buffer: &mut Vec<u32>,
    ) -> (BamTemplate<'a>, bool) {
        let mut best = BestPairInfo::default();
        self.locate_best_pair(candidates, tls, &mut best);

        if best.resolved_count > 0 {
            let (template, settled) =
                self.build_paired_end_template(rog, cluster, candidates, tls, &best);
            if settled && best.best_edit_distance == 0 {
                return (template, true);
            }
        }
        // nothing resolved, or the resolved pair is not anchored in a
        // trustworthy way; give rescuing a chance to find something better
        self.build_disjoined_template(contigs, rog, cluster, candidates, tls, cigar_buffer, &best)
    }

    fn build_paired_end_template<'a>(
        &self,
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        best: &BestPairInfo<'a>,
    ) -> (BamTemplate<'a>, bool) {
        let repeat = self.scatter_index(cluster.id, best.pairs.len());
        let mut template = BamTemplate::unaligned(cluster);
        *template.fragment_mut(0) = best.pairs[repeat][0].clone();
        *template.fragment_mut(1) = best.pairs[repeat][1].clone();

        let read2_anchored = template.fragment(1).is_well_anchored();
        let r1_anchored = self.update_mapping_score(
            template.fragment_mut(0),
            rog,
            &candidates[0],
            read2_anchored,
        );
        let read1_anchored = template.fragment(0).is_well_anchored();
        let r2_anchored = self.update_mapping_score(
            template.fragment_mut(1),
            rog,
            &candidates[1],
            read1_anchored,
        );

        template.set_proper_pair(
            tls.check_model(
                &template.fragment(0).end_geometry(),
                &template.fragment(1).end_geometry(),
            ) == TemplateClass::Nominal,
        );

        if r1_anchored || r2_anchored {
            let other_pairs = (best.total_template_probability
                - best.best_log_probability.exp())
                + rog.template();
            template.set_alignment_score(Some(phred_from_probabilities(
                other_pairs,
                best.total_template_probability + rog.template(),
            )));
            let settled = r1_anchored
                && r2_anchored
                && template.fragment(0).repeat_seeds_count == 0
                && template.fragment(1).repeat_seeds_count == 0;
            (template, settled)
        } else {
            template.set_alignment_score(None);
            trace!("pair-end template looks quite random for cluster {}", cluster.id);
            (template, false)
        }
    }

    fn rescue_shadow_template<'a>(
        &mut self,
        contigs: &[Contig],
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        cigar_buffer: &mut Vec<u32>,
    ) -> (BamTemplate<'a>, bool) {
        let orphan_index = if candidates[0].is_empty() { 1 } else { 0 };
        let shadow_index = 1 - orphan_index;
        let orphans = &candidates[orphan_index];
        let best_orphan_at = self.best_fragment_indexes(orphans)[0];
        let best_orphan_lp = orphans[best_orphan_at].log_probability;

        let mut best_templates: Vec<(FragmentMetadata<'a>, FragmentMetadata<'a>)> = Vec::new();
        let mut best_template_score = u64::MAX;
        let mut best_template_lp = f64::MIN;
        let mut resolved = 0u64;
        let mut total_template_probability = 0.0;
        let mut shadow_probabilities: Vec<(u32, i64, bool, u32, f64)> = Vec::new();
        let mut shadow_list = Vec::new();

        for orphan in orphans {
            if lp_less(orphan.log_probability + ORPHAN_LOG_PROBABILITY_SLACK, best_orphan_lp) {
                continue; // orphan too bad to try rescuing shadows
            }
            let rescued = self.shadow_aligner.rescue_shadow(
                contigs,
                orphan,
                &mut shadow_list,
                cigar_buffer,
                tls,
                0,
            );
            if rescued {
                let best_rescued = shadow_list[0].clone();
                if !is_very_bad_alignment(&best_rescued, cigar_buffer) {
                    let score = orphan.smith_waterman_score as u64
                        + best_rescued.smith_waterman_score as u64;
                    let lp = orphan.log_probability + best_rescued.log_probability;
                    if resolved == 0
                        || score < best_template_score
                        || (score == best_template_score && lp_less(best_template_lp, lp))
                    {
                        best_template_score = score;
                        best_template_lp = lp;
                        best_templates.clear();
                        best_templates.push((orphan.clone(), best_rescued));
                    } else if score == best_template_score && lp_equals(lp, best_template_lp) {
                        best_templates.push((orphan.clone(), best_rescued));
                    }
                    resolved += 1;
                }
            } else if !shadow_list.is_empty() {
                trace!("shadow rescue hits a repeat for cluster {}", cluster.id);
            }
            for shadow in &shadow_list {
                let (contig, position, reverse, length) = shadow.placement();
                shadow_probabilities
                    .push((contig, position, reverse, length, shadow.log_probability));
                total_template_probability +=
                    (orphan.log_probability + shadow.log_probability).exp();
            }
        }

        let mut template = BamTemplate::unaligned(cluster);
        if resolved > 0 {
            let total_shadow_probability = sum_unique_probabilities(&mut shadow_probabilities);
            let repeat = self.scatter_index(cluster.id, best_templates.len());
            let (orphan, mut shadow) = best_templates[repeat].clone();
            *template.fragment_mut(orphan_index) = orphan;
            let clean =
                template.fragment(orphan_index).edit_distance + shadow.edit_distance == 0;
            let anchored =
                self.update_mapping_score(template.fragment_mut(orphan_index), rog, orphans, clean);
            if anchored {
                let shadow_rog = rog.read(shadow_index);
                let other_shadows =
                    (total_shadow_probability - shadow.log_probability.exp()) + shadow_rog;
                shadow.alignment_score = Some(phred_from_probabilities(
                    other_shadows,
                    total_shadow_probability + shadow_rog,
                ));
                let other_pairs =
                    (total_template_probability - best_template_lp.exp()) + rog.template();
                template.set_alignment_score(Some(phred_from_probabilities(
                    other_pairs,
                    total_template_probability + rog.template(),
                )));
                if template.fragment(orphan_index).alignment_score == Some(0)
                    || !template.fragment(orphan_index).is_well_anchored()
                {
                    self.cap_dodgy_but_clean(&mut template, Some(&mut shadow));
                }
                *template.fragment_mut(shadow_index) = shadow;
                let proper = tls.check_model(
                    &template.fragment(0).end_geometry(),
                    &template.fragment(1).end_geometry(),
                ) == TemplateClass::Nominal;
                template.set_proper_pair(proper);
                (template, true)
            } else {
                *template.fragment_mut(shadow_index) = shadow;
                let proper = tls.check_model(
                    &template.fragment(0).end_geometry(),
                    &template.fragment(1).end_geometry(),
                ) == TemplateClass::Nominal;
                template.set_proper_pair(proper);
                let aligned = self.flag_dodgy_template(&mut template);
                (template, aligned)
            }
        } else {
            // nothing rescued: keep the singleton, mark its mate a shadow
            let orphan = orphans[best_orphan_at].clone();
            if is_very_bad_alignment(&orphan, cigar_buffer) {
                for index in 0..template.fragment_count() {
                    template.fragment_mut(index).set_no_match();
                }
                return (template, false);
            }
            let clean = orphan.edit_distance == 0;
            *template.fragment_mut(orphan_index) = orphan;
            {
                let orphan = template.fragment(orphan_index);
                let (contig_id, position) = (orphan.contig_id, orphan.position);
                let shadow = template.fragment_mut(shadow_index);
                shadow.contig_id = contig_id;
                shadow.position = position;
                shadow.alignment_score = Some(0);
                shadow.cigar_length = 0;
            }
            if !self.update_mapping_score(template.fragment_mut(orphan_index), rog, orphans, clean)
            {
                let aligned = self.flag_dodgy_template(&mut template);
                (template, aligned)
            } else {
                if !template.fragment(orphan_index).is_well_anchored() {
                    let fragment = template.fragment_mut(orphan_index);
                    fragment.alignment_score = Some(
                        fragment
                            .alignment_score
                            .unwrap_or(0)
                            .min(DODGY_BUT_CLEAN_ALIGNMENT_SCORE),
                    );
                }
                template.set_alignment_score(Some(0));
                (template, true)
            }
        }
    }

    fn cap_dodgy_but_clean(
        &self,
        template: &mut BamTemplate<'_>,
        shadow: Option<&mut FragmentMetadata<'_>>,
    ) {
        // weakly anchored but clean: keep the evidence visible without
        // overstating the confidence
        let capped = template
            .alignment_score()
            .unwrap_or(0)
            .min(DODGY_BUT_CLEAN_ALIGNMENT_SCORE);
        template.set_alignment_score(Some(capped));
        for index in 0..template.fragment_count() {
            let fragment = template.fragment_mut(index);
            if let Some(score) = fragment.alignment_score {
                fragment.alignment_score = Some(score.min(DODGY_BUT_CLEAN_ALIGNMENT_SCORE));
            }
        }
        if let Some(shadow) = shadow {
            if let Some(score) = shadow.alignment_score {
                shadow.alignment_score = Some(score.min(DODGY_BUT_CLEAN_ALIGNMENT_SCORE));
            }
        }
    }

    /// Rescue fallback when no model pair was found or the found pair has
    /// edits that a longer template might explain better: both reads take a
    /// turn as the orphan, and the best (orphan, rescued-shadow) template
    /// across both wins.
    #[allow(clippy::too_many_arguments)]
    fn build_disjoined_template<'a>(
        &mut self,
        contigs: &[Contig],
        rog: &RestOfGenomeCorrection,
        cluster: &'a Cluster,
        candidates: &[Vec<FragmentMetadata<'a>>; 2],
        tls: &TemplateLengthStatistics,
        cigar_buffer: &mut Vec<u32>,
        known_best: &BestPairInfo<'a>,
    ) -> (BamTemplate<'a>, bool) {
        let best_disjoined = [
            self.best_fragment_indexes(&candidates[0])[0],
            self.best_fragment_indexes(&candidates[1])[0],
        ];
        let best_template_length = known_best.best_template_length();

        let mut best_templates: Vec<(usize, FragmentMetadata<'a>, FragmentMetadata<'a>)> =
            Vec::new();
        let mut best_template_score = u64::MAX;
        let mut best_template_lp = f64::MIN;
        let mut resolved = 0u64;
        let mut total_template_probability = known_best.total_template_probability;
        let mut pair_probabilities: Vec<(u32, i64, bool, u32, f64)> = Vec::new();
        let mut end_probabilities: [Vec<(u32, i64, bool, u32, f64)>; 2] =
            [Vec::new(), Vec::new()];
        let mut shadow_list = Vec::new();

        for orphan_index in 0..2usize {
            let orphans = &candidates[orphan_index];
            let best_orphan_lp = orphans[best_disjoined[orphan_index]].log_probability;
            for orphan in orphans {
                let skip = if known_best.resolved_count > 0 {
                    orphan.edit_distance
                        > known_best.best_edit_distance + SKIP_ORPHAN_EDIT_DISTANCE
                } else {
                    lp_less(
                        orphan.log_probability + ORPHAN_LOG_PROBABILITY_SLACK,
                        best_orphan_lp,
                    )
                };
                if skip {
                    continue;
                }
                let rescued = self.shadow_aligner.rescue_shadow(
                    contigs,
                    orphan,
                    &mut shadow_list,
                    cigar_buffer,
                    tls,
                    best_template_length,
                );
                if rescued {
                    let best_rescued = shadow_list[0].clone();
                    let rescued_edits = orphan.edit_distance + best_rescued.edit_distance;
                    if !is_very_bad_alignment(&best_rescued, cigar_buffer)
                        && (known_best.resolved_count == 0
                            || known_best.best_edit_distance + SKIP_ORPHAN_EDIT_DISTANCE
                                >= rescued_edits)
                    {
                        let score = orphan.smith_waterman_score as u64
                            + best_rescued.smith_waterman_score as u64;
                        let lp = orphan.log_probability + best_rescued.log_probability;
                        if resolved == 0
                            || score < best_template_score
                            || (score == best_template_score && lp_less(best_template_lp, lp))
                        {
                            best_template_score = score;
                            best_template_lp = lp;
                            best_templates.clear();
                            best_templates.push((orphan_index, orphan.clone(), best_rescued));
                        } else if score == best_template_score
                            && lp_equals(lp, best_template_lp)
                        {
                            best_templates.push((orphan_index, orphan.clone(), best_rescued));
                        }
                        resolved += 1;
                    }
                }
                for shadow in &shadow_list {
                    let (contig, position, reverse, length) = shadow.placement();
                    end_probabilities[1 - orphan_index].push((
                        contig,
                        position,
                        reverse,
                        length,
                        shadow.log_probability,
                    ));
                    let pair_lp = orphan.log_probability + shadow.log_probability;
                    let key = if orphan_index == 0 {
                        orphan.placement()
                    } else {
                        shadow.placement()
                    };
                    pair_probabilities.push((key.0, key.1, key.2, key.3, pair_lp));
                }
            }
        }

        let mut template = BamTemplate::unaligned(cluster);
        if resolved > 0 {
            let repeat = self.scatter_index(cluster.id, best_templates.len());
            let (best_orphan_index, orphan, mut shadow) = best_templates[repeat].clone();
            let best_shadow_index = 1 - best_orphan_index;

            // mix in the seed-discovered candidates of each end before
            // computing the per-end probability totals
            for candidate in &candidates[best_shadow_index] {
                let (contig, position, reverse, length) = candidate.placement();
                end_probabilities[best_shadow_index].push((
                    contig,
                    position,
                    reverse,
                    length,
                    candidate.log_probability,
                ));
            }
            for candidate in &candidates[best_orphan_index] {
                let (contig, position, reverse, length) = candidate.placement();
                end_probabilities[best_orphan_index].push((
                    contig,
                    position,
                    reverse,
                    length,
                    candidate.log_probability,
                ));
            }
            let total_shadow_probability =
                sum_unique_probabilities(&mut end_probabilities[best_shadow_index]);
            let total_orphan_probability =
                sum_unique_probabilities(&mut end_probabilities[best_orphan_index]);
            total_template_probability += sum_unique_probabilities(&mut pair_probabilities);

            let rediscovered = repeat == 0
                && known_best.resolved_count > 0
                && known_best
                    .pairs
                    .first()
                    .map(|pair| {
                        pair[best_orphan_index].placement() == orphan.placement()
                            && pair[best_shadow_index].placement() == shadow.placement()
                    })
                    .unwrap_or(false);
            let shadow_well_anchored = rediscovered
                && known_best
                    .pairs
                    .first()
                    .map(|pair| pair[best_shadow_index].is_well_anchored())
                    .unwrap_or(false);

            let clean = orphan.edit_distance + shadow.edit_distance == 0;
            *template.fragment_mut(best_orphan_index) = orphan;
            let anchored = self.update_mapping_score(
                template.fragment_mut(best_orphan_index),
                rog,
                &candidates[best_orphan_index],
                clean || shadow_well_anchored,
            );
            template.set_proper_pair(
                tls.check_model(
                    &template.fragment(best_orphan_index).end_geometry(),
                    &shadow.end_geometry(),
                ) == TemplateClass::Nominal,
            );

            if anchored {
                let shadow_rog = rog.read(best_shadow_index);
                let other_shadows =
                    (total_shadow_probability - shadow.log_probability.exp()) + shadow_rog;
                shadow.alignment_score = Some(phred_from_probabilities(
                    other_shadows,
                    total_shadow_probability + shadow_rog,
                ));
                let orphan_rog = rog.read(best_orphan_index);
                let orphan_lp = template.fragment(best_orphan_index).log_probability;
                let other_orphans = (total_orphan_probability - orphan_lp.exp()) + orphan_rog;
                template.fragment_mut(best_orphan_index).alignment_score = Some(
                    phred_from_probabilities(other_orphans, total_orphan_probability + orphan_rog),
                );
                let other_pairs =
                    (total_template_probability - best_template_lp.exp()) + rog.template();
                template.set_alignment_score(Some(phred_from_probabilities(
                    other_pairs,
                    total_template_probability + rog.template(),
                )));

                let orphan_weak = template.fragment(best_orphan_index).alignment_score
                    == Some(0)
                    || !template.fragment(best_orphan_index).is_well_anchored();
                let shadow_weak = shadow.alignment_score == Some(0) || !shadow_well_anchored;
                if orphan_weak && shadow_weak {
                    self.cap_dodgy_but_clean(&mut template, Some(&mut shadow));
                }
                *template.fragment_mut(best_shadow_index) = shadow;
                (template, true)
            } else {
                let aligned = self.flag_dodgy_template(&mut template);
                if aligned {
                    *template.fragment_mut(best_shadow_index) = shadow;
                }
                (template, aligned)
            }
        } else if known_best.resolved_count > 0 {
            // a reasonable pair exists but could not be rediscovered: it is
            // either outside the consensus template bounds or its shadow
            // keeps hitting repeats
            let (mut template, _) =
                self.build_paired_end_template(rog, cluster, candidates, tls, known_best);
            let aligned = self.flag_dodgy_template(&mut template);
            (template, aligned)
        } else {
            *template.fragment_mut(0) = candidates[0][best_disjoined[0]].clone();
            *template.fragment_mut(1) = candidates[1][best_disjoined[1]].clone();
            template.set_alignment_score(Some(0));
            template.set_proper_pair(false);
            let clean0 = template.fragment(0).edit_distance == 0;
            let clean1 = template.fragment(1).edit_distance == 0;
            let anchored0 =
                self.update_mapping_score(template.fragment_mut(0), rog, &candidates[0], clean0);
            let anchored1 =
                self.update_mapping_score(template.fragment_mut(1), rog, &candidates[1], clean1);
            if !anchored0 && !anchored1 {
                // anomalous pairs are kept only when anchored at least once
                let aligned = self.flag_dodgy_template(&mut template);
                (template, aligned)
            } else {
                for index in 0..2 {
                    if !template.fragment(index).is_well_anchored() {
                        let fragment = template.fragment_mut(index);
                        if let Some(score) = fragment.alignment_score {
                            fragment.alignment_score =
                                Some(score.min(DODGY_BUT_CLEAN_ALIGNMENT_SCORE));
                        }
                    }
                }
                (template, true)
            }
        }
    }
}
