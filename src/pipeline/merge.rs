//! Merge per-page notation into one score.
//!
//! ## Part identity
//!
//! The engine numbers parts `P1`, `P2`, … afresh on every page, so ids from
//! different pages cannot be compared. Parts are matched by position instead:
//! the k-th part declared on any page feeds merged part `P{k}`. The mapping is
//! keyed by `(page_index, original_id)` and kept on the result, so callers
//! can see where every merged part came from.
//!
//! ## Measure numbering
//!
//! Measures are renumbered from 1 across the whole score. Each recognised
//! page occupies a contiguous block as long as its longest part. A part that
//! is shorter on a page, or missing from it, is padded with whole-measure
//! rests up to the block's end, so every part has the same length and stays
//! aligned with its siblings. A part seen only from a later page is padded at
//! the front for the blocks before it. Padding on a page where the part was
//! present but short also records a [`MergeWarning::RaggedPage`].
//!
//! Failed pages contribute nothing except an entry in
//! [`MergedDocument::dropped_pages`]. Merging is deterministic: the same
//! results in any order produce the same document.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FailureKind, MergeWarning};
use crate::notation::{NotationFragment, XmlElement, XmlNode};
use crate::output::{RecognitionOutcome, RecognitionResult};

/// One measure of the merged score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedMeasure {
    /// Score-wide 1-based number.
    pub number: u32,
    pub source_page: usize,
    /// Number the engine gave it on its own page.
    pub original_number: String,
    /// The measure element, its `number` attribute already rewritten.
    pub element: XmlElement,
    /// Filler rest inserted to keep parts the same length.
    pub padded: bool,
}

impl MergedMeasure {
    fn rest(number: u32, source_page: usize, clock: Option<&MeasureClock>) -> Self {
        let mut element = XmlElement::new("measure");
        element.set_attr("number", number.to_string());
        if clock.is_none() && number == 1 {
            let mut attributes = XmlElement::new("attributes");
            attributes
                .children
                .push(XmlNode::Element(XmlElement::with_text("divisions", "1")));
            element.children.push(XmlNode::Element(attributes));
        }
        let duration = clock.copied().unwrap_or_default().measure_duration();

        let mut rest = XmlElement::new("rest");
        rest.set_attr("measure", "yes");
        let mut note = XmlElement::new("note");
        note.children.push(XmlNode::Element(rest));
        note.children.push(XmlNode::Element(XmlElement::with_text(
            "duration",
            duration.to_string(),
        )));
        element.children.push(XmlNode::Element(note));

        Self {
            number,
            source_page,
            original_number: String::new(),
            element,
            padded: true,
        }
    }
}

/// Divisions and time signature in force at the end of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MeasureClock {
    divisions: u32,
    beats: u32,
    beat_type: u32,
}

impl Default for MeasureClock {
    fn default() -> Self {
        Self {
            divisions: 1,
            beats: 4,
            beat_type: 4,
        }
    }
}

impl MeasureClock {
    /// Apply any `<attributes>` the measure carries.
    fn advance(&mut self, measure: &XmlElement) {
        for attributes in measure
            .child_elements()
            .filter(|e| e.name == "attributes")
        {
            let number = |e: Option<&XmlElement>| {
                e.and_then(XmlElement::text)
                    .and_then(|t| t.trim().parse::<u32>().ok())
                    .filter(|n| *n > 0)
            };
            if let Some(divisions) = number(attributes.child("divisions")) {
                self.divisions = divisions;
            }
            if let Some(time) = attributes.child("time") {
                if let (Some(beats), Some(beat_type)) =
                    (number(time.child("beats")), number(time.child("beat-type")))
                {
                    self.beats = beats;
                    self.beat_type = beat_type;
                }
            }
        }
    }

    fn measure_duration(&self) -> u32 {
        (self.divisions * self.beats * 4 / self.beat_type).max(1)
    }
}

/// One part of the merged score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPart {
    /// `P1`, `P2`, … in declaration order.
    pub id: String,
    pub name: Option<String>,
    /// The `<score-part>` that introduced this part, id rewritten.
    pub score_part: Option<XmlElement>,
    pub measures: Vec<MergedMeasure>,
}

/// Where a page's part ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMapping {
    pub page_index: usize,
    pub original_id: String,
    pub merged_id: String,
}

/// A page left out of the score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedPage {
    pub page_index: usize,
    pub kind: FailureKind,
    pub reason: String,
}

/// The combined score.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedDocument {
    pub title: Option<String>,
    pub parts: Vec<MergedPart>,
    /// Recognised page indices in score order.
    pub pages: Vec<usize>,
    pub dropped_pages: Vec<DroppedPage>,
    pub warnings: Vec<MergeWarning>,
    pub part_map: Vec<PartMapping>,
}

impl MergedDocument {
    /// Length of the longest merged part.
    pub fn measure_count(&self) -> usize {
        self.parts.iter().map(|p| p.measures.len()).max().unwrap_or(0)
    }

    /// Recognised measures contributed by `page_index`, over all parts.
    pub fn measures_from_page(&self, page_index: usize) -> usize {
        self.parts
            .iter()
            .flat_map(|p| &p.measures)
            .filter(|m| m.source_page == page_index && !m.padded)
            .count()
    }

    /// Merged id that `original_id` on `page_index` was mapped to.
    pub fn merged_id(&self, page_index: usize, original_id: &str) -> Option<&str> {
        self.part_map
            .iter()
            .find(|m| m.page_index == page_index && m.original_id == original_id)
            .map(|m| m.merged_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Per-run part table: assigns merged slots by declaration position.
#[derive(Default)]
struct PartTable {
    entries: BTreeMap<(usize, String), usize>,
}

impl PartTable {
    /// Register every part of one page and return `original id → slot`.
    fn register_page(
        &mut self,
        page: usize,
        fragment: &NotationFragment,
        parts: &mut Vec<MergedPart>,
        warnings: &mut Vec<MergeWarning>,
    ) -> HashMap<String, usize> {
        let mut local: HashMap<String, usize> = HashMap::new();
        let mut created_here: Vec<usize> = Vec::new();
        let mut position = 0usize;

        for declared in &fragment.part_list {
            let slot = match local.get(&declared.id) {
                Some(&existing) => {
                    warnings.push(MergeWarning::DuplicatePartId {
                        page_index: page,
                        part_id: declared.id.clone(),
                    });
                    existing
                }
                None => {
                    let slot = position;
                    position += 1;
                    if ensure_slot(parts, slot) {
                        created_here.push(slot);
                    }
                    local.insert(declared.id.clone(), slot);
                    slot
                }
            };

            // The later declaration wins for parts this page introduced.
            if created_here.contains(&slot) || parts[slot].score_part.is_none() {
                let merged = &mut parts[slot];
                let mut element = declared.element.clone();
                element.set_attr("id", merged.id.clone());
                merged.score_part = Some(element);
                merged.name = declared.name.clone();
            }
            self.entries.insert((page, declared.id.clone()), slot);
        }

        // Parts without a part-list entry still get a slot.
        for part in &fragment.parts {
            if !local.contains_key(&part.id) {
                let slot = position;
                position += 1;
                ensure_slot(parts, slot);
                local.insert(part.id.clone(), slot);
                self.entries.insert((page, part.id.clone()), slot);
            }
        }

        local
    }

    fn into_mappings(self, parts: &[MergedPart]) -> Vec<PartMapping> {
        self.entries
            .into_iter()
            .map(|((page_index, original_id), slot)| PartMapping {
                page_index,
                original_id,
                merged_id: parts[slot].id.clone(),
            })
            .collect()
    }
}

/// Grow `parts` so `slot` exists. Returns true when the slot was created.
fn ensure_slot(parts: &mut Vec<MergedPart>, slot: usize) -> bool {
    if slot < parts.len() {
        return false;
    }
    while parts.len() <= slot {
        let n = parts.len() + 1;
        parts.push(MergedPart {
            id: format!("P{n}"),
            name: None,
            score_part: None,
            measures: Vec::new(),
        });
    }
    true
}

/// Combine page results into one score, in page order.
///
/// When the same page appears twice the later result wins and a
/// [`MergeWarning::DuplicatePage`] is recorded.
pub fn merge(results: &[RecognitionResult]) -> MergedDocument {
    let mut warnings = Vec::new();

    let mut by_page: BTreeMap<usize, &RecognitionResult> = BTreeMap::new();
    for result in results {
        if by_page.insert(result.page_index, result).is_some() {
            warnings.push(MergeWarning::DuplicatePage {
                page_index: result.page_index,
            });
        }
    }

    let mut doc = MergedDocument::default();
    let mut table = PartTable::default();
    let mut offset: u32 = 0;
    let mut clocks: BTreeMap<usize, MeasureClock> = BTreeMap::new();
    // (page, measures) for every block already laid out.
    let mut blocks: Vec<(usize, u32)> = Vec::new();

    for (&page, result) in &by_page {
        let fragment = match &result.outcome {
            RecognitionOutcome::Recognized(f) => f,
            RecognitionOutcome::Failed(f) => {
                doc.dropped_pages.push(DroppedPage {
                    page_index: page,
                    kind: f.kind,
                    reason: f.reason.clone(),
                });
                continue;
            }
        };

        if doc.title.is_none() {
            doc.title = fragment.title.clone();
        }

        let slots = table.register_page(page, fragment, &mut doc.parts, &mut warnings);

        // Parts first seen here catch up with the blocks laid out before them.
        for part in doc.parts.iter_mut().filter(|p| p.measures.is_empty()) {
            let mut number = 0;
            for &(block_page, span) in &blocks {
                for _ in 0..span {
                    number += 1;
                    part.measures.push(MergedMeasure::rest(number, block_page, None));
                }
            }
        }

        // Measures appended per slot on this page; repeated <part> ids concatenate.
        let mut written: BTreeMap<usize, u32> = BTreeMap::new();
        for part in &fragment.parts {
            let slot = slots[&part.id];
            let count = written.entry(slot).or_insert(0);
            for measure in &part.measures {
                *count += 1;
                let number = offset + *count;
                let mut element = measure.element.clone();
                element.set_attr("number", number.to_string());
                clocks.entry(slot).or_default().advance(&element);
                doc.parts[slot].measures.push(MergedMeasure {
                    number,
                    source_page: page,
                    original_number: measure.number.clone(),
                    element,
                    padded: false,
                });
            }
        }

        let span = written.values().copied().max().unwrap_or(0);
        let touched: BTreeSet<usize> = slots.values().copied().collect();
        for slot in touched {
            let count = written.get(&slot).copied().unwrap_or(0);
            if count < span {
                warnings.push(MergeWarning::RaggedPage {
                    page_index: page,
                    part_id: doc.parts[slot].id.clone(),
                    measures: count as usize,
                    expected: span as usize,
                });
            }
        }

        let end = offset + span;
        for (slot, part) in doc.parts.iter_mut().enumerate() {
            let clock = clocks.get(&slot);
            while (part.measures.len() as u32) < end {
                let number = part.measures.len() as u32 + 1;
                part.measures.push(MergedMeasure::rest(number, page, clock));
            }
        }

        debug!("Merged page {}: {} measures at offset {}", page + 1, span, offset);
        offset = end;
        blocks.push((page, span));
        doc.pages.push(page);
    }

    for w in &warnings {
        warn!("{w}");
    }
    doc.part_map = table.into_mappings(&doc.parts);
    doc.warnings = warnings;
    doc
}
