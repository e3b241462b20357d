use crate::aggregator::{AggregationState, Finality};
use crate::beacon::SLOTS_PER_EPOCH;

/// Glyph drawn instead of a slot number that does not fit its cell.
pub const PLACEHOLDER_GLYPH: char = '■';

/// Horizontal padding on each side of a slot label.
const LABEL_PADDING: usize = 1;

/// One slot as it appears in a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCell {
    pub slot: u64,
    pub finality: Finality,
    /// Padded label or placeholder, `slot_width` columns wide when it fits.
    pub text: String,
}

/// One epoch and its slots in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRow {
    pub epoch: u64,
    pub cells: Vec<SlotCell>,
}

impl EpochRow {
    /// Concatenate the cells, clipped to `width` columns.
    pub fn to_text(&self, width: usize) -> String {
        self.cells
            .iter()
            .flat_map(|cell| cell.text.chars())
            .take(width)
            .collect()
    }
}

/// Columns available to one slot when a full epoch spans `width`.
pub fn slot_width(width: usize) -> usize {
    width / SLOTS_PER_EPOCH as usize
}

/// Label for `slot` in a cell `slot_width` columns wide.
///
/// The decimal slot number with one column of padding on each side when that
/// fits, otherwise a single placeholder glyph.
pub fn slot_label(slot: u64, slot_width: usize) -> String {
    let digits = slot.to_string();
    let padded = digits.len() + 2 * LABEL_PADDING;

    if padded > slot_width {
        return format!("{PLACEHOLDER_GLYPH:<slot_width$}");
    }

    let inner = slot_width - 2 * LABEL_PADDING;
    format!(" {digits:<inner$} ")
}

/// Build one row per epoch, most recent first.
pub fn render(state: &AggregationState, width: usize) -> Vec<EpochRow> {
    let cell_width = slot_width(width);

    state
        .epochs_desc()
        .map(|(epoch, bucket)| EpochRow {
            epoch,
            cells: bucket
                .slots()
                .iter()
                .map(|event| SlotCell {
                    slot: event.slot,
                    finality: state.classify(event),
                    text: slot_label(event.slot, cell_width),
                })
                .collect(),
        })
        .collect()
}

/// Plain-text view: at most `height` rows of at most `width` columns.
pub fn render_text(state: &AggregationState, width: usize, height: usize) -> String {
    render(state, width)
        .iter()
        .take(height)
        .map(|row| row.to_text(width))
        .collect::<Vec<_>>()
        .join("\n")
}
