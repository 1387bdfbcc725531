//! Duplicate identification and filtering over one bin's index vectors.
//!
//! Candidates group on `(position key, mate anchor, mate info, library)`;
//! within a group the winner has the highest duplicate rank, ties broken by
//! global cluster id. Two entries of the same `(tile, cluster)` are the two
//! mates of one template and never suppress each other, even when both ends
//! face the same way at the same position.

use rayon::prelude::*;

use crate::build::fragment_index::{FStrandFragmentIndex, RStrandOrShadowFragmentIndex};
use crate::build::packed_buffer::{Index, PackedFragmentBuffer};
use crate::build::stats::BuildStats;

/// Library resolution: the sample index when lanes of one sample share a
/// library (so PCR duplicates across lanes are caught), the barcode index
/// otherwise.
pub struct LibraryResolver<'a> {
    single_library_samples: bool,
    barcode_sample_index: &'a [u32],
}

impl<'a> LibraryResolver<'a> {
    pub fn new(single_library_samples: bool, barcode_sample_index: &'a [u32]) -> Self {
        LibraryResolver {
            single_library_samples,
            barcode_sample_index,
        }
    }

    fn library(&self, fragments: &PackedFragmentBuffer, data_offset: u64) -> u64 {
        let barcode = fragments.fragment(data_offset as usize).barcode();
        if self.single_library_samples {
            self.barcode_sample_index[barcode as usize] as u64
        } else {
            barcode as u64
        }
    }
}

/// An index entry that can take part in duplicate grouping.
pub trait DuplicateCandidate: Copy + Send {
    /// The grouping key, excluding the library.
    fn group_key(&self) -> (u64, u64, u64);
    fn duplicate_rank(&self) -> u64;
    fn data_offset(&self) -> u64;
    fn mate_data_offset(&self) -> u64;
    fn f_strand_pos(&self) -> crate::position::ReferencePosition;
}

impl DuplicateCandidate for crate::build::fragment_index::SeFragmentIndex {
    /// Single-ended entries never enter duplicate grouping (only passed
    /// through `pass_all`), so the grouping key and rank are unused.
    fn group_key(&self) -> (u64, u64, u64) {
        (self.f_strand_pos.value(), 0, 0)
    }

    fn duplicate_rank(&self) -> u64 {
        0
    }

    fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn mate_data_offset(&self) -> u64 {
        self.data_offset
    }

    fn f_strand_pos(&self) -> crate::position::ReferencePosition {
        self.f_strand_pos
    }
}

impl DuplicateCandidate for FStrandFragmentIndex {
    fn group_key(&self) -> (u64, u64, u64) {
        (self.f_strand_pos.value(), self.mate.anchor, self.mate.info)
    }

    fn duplicate_rank(&self) -> u64 {
        self.duplicate_cluster_rank
    }

    fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn mate_data_offset(&self) -> u64 {
        self.mate_data_offset
    }

    fn f_strand_pos(&self) -> crate::position::ReferencePosition {
        self.f_strand_pos
    }
}

impl DuplicateCandidate for RStrandOrShadowFragmentIndex {
    /// Reverse reads and shadows group on their own anchor: the r-strand 5'
    /// position for aligned reads, the packed leading bases for shadows.
    fn group_key(&self) -> (u64, u64, u64) {
        (self.anchor, self.mate.anchor, self.mate.info)
    }

    fn duplicate_rank(&self) -> u64 {
        self.duplicate_cluster_rank
    }

    fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn mate_data_offset(&self) -> u64 {
        self.mate_data_offset
    }

    fn f_strand_pos(&self) -> crate::position::ReferencePosition {
        self.f_strand_pos
    }
}

fn to_index<C: DuplicateCandidate>(entry: &C) -> Index {
    Index::new(
        entry.f_strand_pos(),
        entry.data_offset() as usize,
        entry.mate_data_offset() as usize,
    )
}

/// Pass-through filter used for single-ended records and for runs where
/// duplicates are neither marked nor removed.
pub fn pass_all<C: DuplicateCandidate>(
    fragments: &PackedFragmentBuffer,
    entries: &[C],
    stats: &mut BuildStats,
    bin_stats_index: usize,
    results: &mut Vec<Index>,
) {
    for entry in entries {
        let barcode = fragments.fragment(entry.data_offset() as usize).barcode();
        stats.increment_total(bin_stats_index, barcode as usize);
        stats.increment_unique(bin_stats_index, barcode as usize);
        results.push(to_index(entry));
    }
}

/// Groups, ranks and filters the entries. `keep_duplicates` retains losers
/// with the duplicate flag set instead of dropping them.
pub fn filter_duplicates<C: DuplicateCandidate>(
    resolver: &LibraryResolver<'_>,
    fragments: &mut PackedFragmentBuffer,
    entries: &mut Vec<C>,
    keep_duplicates: bool,
    stats: &mut BuildStats,
    bin_stats_index: usize,
    results: &mut Vec<Index>,
) {
    if entries.is_empty() {
        return;
    }

    // libraries must group together: duplicates are only removed within one
    let keyed: Vec<(u64, C)> = entries
        .drain(..)
        .map(|entry| (resolver.library(fragments, entry.data_offset()), entry))
        .collect();
    let mut keyed = keyed;
    {
        let reader: &PackedFragmentBuffer = fragments;
        keyed.par_sort_unstable_by(|(left_library, left), (right_library, right)| {
            left.group_key()
                .cmp(&right.group_key())
                .then(left_library.cmp(right_library))
                // higher rank on top
                .then(right.duplicate_rank().cmp(&left.duplicate_rank()))
                .then_with(|| {
                    let left_cluster = reader
                        .fragment(left.data_offset() as usize)
                        .global_cluster_id();
                    let right_cluster = reader
                        .fragment(right.data_offset() as usize)
                        .global_cluster_id();
                    left_cluster.cmp(&right_cluster)
                })
                // two ends of one template can tie on everything else
                .then(left.data_offset().cmp(&right.data_offset()))
        });
    }

    let mut last_selected = 0usize;
    for at in 0..keyed.len() {
        let (library, entry) = &keyed[at];
        let barcode = fragments.fragment(entry.data_offset() as usize).barcode();
        stats.increment_total(bin_stats_index, barcode as usize);
        let duplicate_of_selected = at != 0 && {
            let (selected_library, selected) = &keyed[last_selected];
            selected.group_key() == entry.group_key()
                && selected_library == library
                && fragments
                    .fragment(selected.data_offset() as usize)
                    .global_cluster_id()
                    != fragments.fragment(entry.data_offset() as usize).global_cluster_id()
        };
        if !duplicate_of_selected {
            stats.increment_unique(bin_stats_index, barcode as usize);
            results.push(to_index(entry));
            last_selected = at;
        } else if keep_duplicates {
            fragments
                .fragment_mut(entry.data_offset() as usize)
                .set_duplicate(true);
            results.push(to_index(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::fragment_index::FragmentIndexMate;
    use crate::fragment::{FragmentFlags, FragmentHeader, HEADER_SIZE};
    use crate::position::ReferencePosition;

    fn store_fragment(
        bytes: &mut Vec<u8>,
        pos: ReferencePosition,
        tile: u32,
        cluster_id: u64,
        barcode: u32,
    ) -> u64 {
        let header = FragmentHeader {
            bam_tlen: 0,
            observed_length: 100,
            f_strand_position: pos,
            low_clipped: 0,
            high_clipped: 0,
            alignment_score: 40,
            template_alignment_score: 40,
            mate_f_strand_position: pos,
            read_length: 0,
            cigar_length: 0,
            gap_count: 0,
            edit_distance: 0,
            flags: FragmentFlags {
                paired: true,
                ..Default::default()
            },
            tile,
            barcode,
            mate_storage_bin: 0,
            barcode_sequence: 0,
            cluster_id,
            cluster_x: 0,
            cluster_y: 0,
            duplicate_cluster_rank: 0,
            mate_anchor: 0,
        };
        let offset = bytes.len();
        bytes.resize(offset + HEADER_SIZE, 0);
        header.write_to(&mut bytes[offset..]);
        offset as u64
    }

    fn entry(pos: ReferencePosition, rank: u64, data_offset: u64) -> FStrandFragmentIndex {
        FStrandFragmentIndex {
            f_strand_pos: pos,
            mate: FragmentIndexMate::new(false, true, 3, 12345),
            duplicate_cluster_rank: rank,
            data_offset,
            mate_data_offset: data_offset,
        }
    }

    struct Fixture {
        fragments: PackedFragmentBuffer,
        entries: Vec<FStrandFragmentIndex>,
        stats: BuildStats,
    }

    /// Two identical templates from distinct clusters plus one at another
    /// position.
    fn fixture() -> Fixture {
        let pos = ReferencePosition::new(0, 5000);
        let other = ReferencePosition::new(0, 7777);
        let mut bytes = Vec::new();
        let first = store_fragment(&mut bytes, pos, 1, 100, 0);
        let second = store_fragment(&mut bytes, pos, 2, 200, 0);
        let third = store_fragment(&mut bytes, other, 1, 300, 0);
        Fixture {
            fragments: PackedFragmentBuffer::from_bytes(bytes),
            entries: vec![
                entry(pos, 900, first),
                entry(pos, 500, second),
                entry(other, 700, third),
            ],
            stats: BuildStats::new(1, 1),
        }
    }

    #[test]
    fn duplicate_loser_is_dropped() {
        let mut fixture = fixture();
        let resolver = LibraryResolver::new(false, &[0]);
        let mut results = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fixture.fragments,
            &mut fixture.entries,
            false,
            &mut fixture.stats,
            0,
            &mut results,
        );
        assert_eq!(results.len(), 2);
        // the higher-ranked record of the duplicate pair survives
        let survivor = fixture.fragments.fragment(results[0].data_offset);
        assert_eq!(survivor.cluster_id(), 100);
        assert_eq!(fixture.stats.total(0, 0), 3);
        assert_eq!(fixture.stats.unique(0, 0), 2);
    }

    #[test]
    fn duplicate_loser_is_marked_when_kept() {
        let mut fixture = fixture();
        let resolver = LibraryResolver::new(false, &[0]);
        let mut results = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fixture.fragments,
            &mut fixture.entries,
            true,
            &mut fixture.stats,
            0,
            &mut results,
        );
        assert_eq!(results.len(), 3);
        let marked: Vec<bool> = results
            .iter()
            .map(|index| fixture.fragments.fragment(index.data_offset).flags().duplicate)
            .collect();
        assert_eq!(marked.iter().filter(|&&m| m).count(), 1);
        // the winner stays unmarked
        assert!(!fixture.fragments.fragment(results[0].data_offset).flags().duplicate);
    }

    #[test]
    fn mates_of_one_template_never_suppress_each_other() {
        let pos = ReferencePosition::new(0, 5000);
        let mut bytes = Vec::new();
        // same (tile, cluster): the two ends of one template facing the
        // same way at the same position
        let first = store_fragment(&mut bytes, pos, 1, 100, 0);
        let second = store_fragment(&mut bytes, pos, 1, 100, 0);
        let mut fragments = PackedFragmentBuffer::from_bytes(bytes);
        let mut entries = vec![entry(pos, 900, first), entry(pos, 900, second)];
        let resolver = LibraryResolver::new(false, &[0]);
        let mut stats = BuildStats::new(1, 1);
        let mut results = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fragments,
            &mut entries,
            false,
            &mut stats,
            0,
            &mut results,
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn different_libraries_do_not_deduplicate() {
        let pos = ReferencePosition::new(0, 5000);
        let mut bytes = Vec::new();
        let first = store_fragment(&mut bytes, pos, 1, 100, 0);
        let second = store_fragment(&mut bytes, pos, 2, 200, 1);
        let mut fragments = PackedFragmentBuffer::from_bytes(bytes);
        let mut entries = vec![entry(pos, 900, first), entry(pos, 500, second)];
        let resolver = LibraryResolver::new(false, &[0, 1]);
        let mut stats = BuildStats::new(1, 2);
        let mut results = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fragments,
            &mut entries,
            false,
            &mut stats,
            0,
            &mut results,
        );
        assert_eq!(results.len(), 2);

        // with single-library samples both barcodes map to one sample and
        // the duplicate collapses
        let mut fragments = PackedFragmentBuffer::from_bytes({
            let mut bytes = Vec::new();
            store_fragment(&mut bytes, pos, 1, 100, 0);
            store_fragment(&mut bytes, pos, 2, 200, 1);
            bytes
        });
        let mut entries = vec![entry(pos, 900, first), entry(pos, 500, second)];
        let resolver = LibraryResolver::new(true, &[0, 0]);
        let mut results = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fragments,
            &mut entries,
            false,
            &mut stats,
            0,
            &mut results,
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn filtering_is_idempotent() {
        let mut fixture = fixture();
        let resolver = LibraryResolver::new(false, &[0]);
        let mut first_pass = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fixture.fragments,
            &mut fixture.entries,
            false,
            &mut fixture.stats,
            0,
            &mut first_pass,
        );
        // run the survivors through again; the set must not change
        let mut survivors: Vec<FStrandFragmentIndex> = first_pass
            .iter()
            .map(|index| entry(index.pos, 900, index.data_offset as u64))
            .collect();
        let mut second_pass = Vec::new();
        filter_duplicates(
            &resolver,
            &mut fixture.fragments,
            &mut survivors,
            false,
            &mut fixture.stats,
            0,
            &mut second_pass,
        );
        assert_eq!(first_pass.len(), second_pass.len());
        let offsets = |v: &[Index]| {
            let mut o: Vec<usize> = v.iter().map(|i| i.data_offset).collect();
            o.sort_unstable();
            o
        };
        assert_eq!(offsets(&first_pass), offsets(&second_pass));
    }
}
