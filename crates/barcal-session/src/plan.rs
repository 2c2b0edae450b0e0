//! Calibration plan: one zero step followed by every weight placement.
//!
//! With `n` bars of `c` channels each there are `3·(n−1)·c` placements. Row
//! `r` of the weight matrix puts the weight on bay `r / 6`, side
//! `(r / 2) % 3`, face `r % 2`, so each bay is visited on all three sides,
//! front then back, before moving to the next one.

use crate::error::{SessionError, SessionResult};
use serde::Serialize;
use std::fmt;

/// Zero or weight sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Shelf cleared, readings become `ad0`.
    Zero,
    /// Weight placed, readings become one row of `adv`.
    Weight,
}

/// Side of a bay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Left.
    Left,
    /// Middle.
    Middle,
    /// Right.
    Right,
}

/// Depth position on the shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Face {
    /// Front.
    Front,
    /// Back.
    Back,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Left => "LEFT",
            Side::Middle => "MIDDLE",
            Side::Right => "RIGHT",
        })
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Face::Front => "FRONT",
            Face::Back => "BACK",
        })
    }
}

const BAY_NAMES: [&str; 8] = [
    "FIRST", "SECOND", "THIRD", "FOURTH", "FIFTH", "SIXTH", "SEVENTH", "EIGHTH",
];

/// Where the weight goes for one weight row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Zero-based bay.
    pub bay: usize,
    /// Side within the bay.
    pub side: Side,
    /// Front or back.
    pub face: Face,
}

impl Placement {
    /// Placement for weight row `row`.
    pub fn for_row(row: usize) -> Self {
        let side = match (row / 2) % 3 {
            0 => Side::Left,
            1 => Side::Middle,
            _ => Side::Right,
        };
        let face = if row % 2 == 0 { Face::Front } else { Face::Back };
        Self {
            bay: row / 6,
            side,
            face,
        }
    }

    /// `FIRST`, `SECOND`, ... for the first eight bays, `BAY(n)` beyond.
    pub fn bay_name(&self) -> String {
        BAY_NAMES
            .get(self.bay)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("BAY({})", self.bay))
    }
}

/// One planned sampling action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStep {
    /// Position in the plan.
    pub step_index: usize,
    /// Zero or weight.
    pub kind: StepKind,
    /// Row of the weight matrix (`None` for the zero step).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    /// Short label (`[ZERO]`, `[0001]`, ...).
    pub label: String,
    /// Operator instruction.
    pub prompt: String,
    /// Weight placement (`None` for the zero step).
    #[serde(skip)]
    pub placement: Option<Placement>,
}

/// The ordered plan and the matrix shape it fills.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationPlan {
    /// Steps in sampling order; index 0 is always the zero step.
    pub steps: Vec<CalibrationStep>,
    /// Weight rows (`steps.len() − 1`).
    pub rows: usize,
    /// Matrix columns, bars × channels.
    pub columns: usize,
}

impl CalibrationPlan {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Never true for a built plan.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`.
    pub fn step(&self, index: usize) -> SessionResult<&CalibrationStep> {
        self.steps.get(index).ok_or(SessionError::InvalidStep {
            index,
            steps: self.steps.len(),
        })
    }
}

/// Instruction shown for the zero step.
pub const ZERO_PROMPT: &str = "Clear the Bay(s)";

/// Builds the plan for `bars` bars with `channels` active channels each.
///
/// # Errors
/// [`SessionError::InvalidPlan`] with fewer than two bars or no channels,
/// since there would be no weight placement to sample.
pub fn build_plan(bars: usize, channels: usize, weight: u32) -> SessionResult<CalibrationPlan> {
    if bars < 2 || channels == 0 {
        return Err(SessionError::InvalidPlan { bars, channels });
    }
    let rows = 3 * (bars - 1) * channels;
    let mut steps = Vec::with_capacity(rows + 1);
    steps.push(CalibrationStep {
        step_index: 0,
        kind: StepKind::Zero,
        row: None,
        label: "[ZERO]".to_string(),
        prompt: ZERO_PROMPT.to_string(),
        placement: None,
    });
    for row in 0..rows {
        let placement = Placement::for_row(row);
        steps.push(CalibrationStep {
            step_index: row + 1,
            kind: StepKind::Weight,
            row: Some(row),
            label: format!("[{:04}]", row + 1),
            prompt: format!(
                "Put {} on the {} Bay on the {} side in the {} of the Shelf",
                weight,
                placement.bay_name(),
                placement.side,
                placement.face
            ),
            placement: Some(placement),
        });
    }
    Ok(CalibrationPlan {
        steps,
        rows,
        columns: bars * channels,
    })
}
