//! Profile labels, raw profiles and selection criteria
//!
//! Labels are read once per scan and are immutable afterwards. The only
//! mutation is explicit relabeling ([`relabel_rejected`]), which returns a
//! new label set; selection always works on whatever set it is handed, so
//! the relabel-before-select ordering is carried by the data flow.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Acquisition type of a profile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LabelType {
    #[default]
    Normal,
    /// Rejected by the scanner (e.g. respiratory gating)
    Rejected,
    /// EPI calibration echo with alternating readout polarity
    EchoPhase,
    /// Noise-only samples (receiver on, no RF)
    Noise,
    /// Navigator / phase correction profile
    PhaseCorrection,
    Other,
}

/// Per-profile acquisition metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    pub typ: LabelType,
    pub mix: u16,
    pub stack: u16,
    pub dynamic: u16,
    pub cardiac_phase: u16,
    pub echo: u16,
    pub location: u16,
    pub channel: u16,
    /// Extra dimension index (flow segment)
    pub flow_segment: u16,
    pub ky: i32,
    pub kz: i32,
    /// Gradient echo number within the EPI train
    pub grad: i32,
    /// Readout polarity (+1 / -1)
    pub sign: i8,
    pub average: u16,
    /// Delay since the cardiac trigger in ms
    pub trigger_time: f64,
    /// RR interval of the heartbeat the profile belongs to, in ms
    pub rr_interval: f64,
}

/// One channel's complex sample vector together with its label
#[derive(Clone, Debug, PartialEq)]
pub struct RawProfile {
    pub label: Label,
    pub samples: Vec<Complex64>,
}

impl RawProfile {
    pub fn new(label: Label, samples: Vec<Complex64>) -> Self {
        Self { label, samples }
    }
}

/// Which profiles to read for one iteration
///
/// Constructed fresh for every (mix, stack, segment) combination; it is
/// never mutated across iterations.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionCriteria {
    pub typ: LabelType,
    pub mix: Option<u16>,
    pub stack: Option<u16>,
    pub flow_segment: Option<u16>,
    pub ky: Option<i32>,
    pub kz: Option<i32>,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            typ: LabelType::Normal,
            mix: None,
            stack: None,
            flow_segment: None,
            ky: None,
            kz: None,
        }
    }
}

impl SelectionCriteria {
    /// Normal profiles of one mix and stack
    pub fn for_iteration(mix: u16, stack: u16) -> Self {
        Self {
            mix: Some(mix),
            stack: Some(stack),
            ..Self::default()
        }
    }

    pub fn with_type(&self, typ: LabelType) -> Self {
        Self { typ, ..self.clone() }
    }

    pub fn with_flow_segment(&self, segment: u16) -> Self {
        Self { flow_segment: Some(segment), ..self.clone() }
    }

    pub fn with_ky(&self, ky: i32) -> Self {
        Self { ky: Some(ky), ..self.clone() }
    }

    pub fn with_kz(&self, kz: i32) -> Self {
        Self { kz: Some(kz), ..self.clone() }
    }

    pub fn matches(&self, label: &Label) -> bool {
        label.typ == self.typ
            && self.mix.is_none_or(|m| label.mix == m)
            && self.stack.is_none_or(|s| label.stack == s)
            && self.flow_segment.is_none_or(|f| label.flow_segment == f)
            && self.ky.is_none_or(|ky| label.ky == ky)
            && self.kz.is_none_or(|kz| label.kz == kz)
    }
}

/// Distinct label values found among the normal profiles of a scan
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelInventory {
    pub mixes: Vec<u16>,
    pub stacks: Vec<u16>,
    pub flow_segments: Vec<u16>,
    pub locations: Vec<u16>,
    pub channels: Vec<u16>,
}

impl LabelInventory {
    pub fn from_labels(labels: &[Label]) -> Self {
        let normal = || labels.iter().filter(|l| l.typ == LabelType::Normal);
        Self {
            mixes: unique(normal().map(|l| l.mix)),
            stacks: unique(normal().map(|l| l.stack)),
            flow_segments: unique(normal().map(|l| l.flow_segment)),
            locations: unique(normal().map(|l| l.location)),
            channels: unique(normal().map(|l| l.channel)),
        }
    }

    /// Every (mix, stack) pair in ascending order
    pub fn iterations(&self) -> Vec<(u16, u16)> {
        self.mixes
            .iter()
            .flat_map(|&m| self.stacks.iter().map(move |&s| (m, s)))
            .collect()
    }
}

/// Sorted distinct values
pub fn unique<T: Ord, I: IntoIterator<Item = T>>(values: I) -> Vec<T> {
    values.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Copy of `labels` with every rejected profile turned into a normal one
pub fn relabel_rejected(labels: &[Label]) -> Vec<Label> {
    labels
        .iter()
        .map(|l| {
            let mut l = l.clone();
            if l.typ == LabelType::Rejected {
                l.typ = LabelType::Normal;
            }
            l
        })
        .collect()
}

/// Render labels as a fixed-width text table
pub fn format_label_table(labels: &[Label]) -> String {
    const HEADERS: [&str; 15] = [
        "typ", "mix", "stack", "dyn", "card", "echo", "loca", "chan", "extr1", "ky", "kz", "grad",
        "sign", "aver", "rtop",
    ];
    let rows: Vec<[String; 15]> = labels
        .iter()
        .map(|l| {
            [
                format!("{:?}", l.typ),
                l.mix.to_string(),
                l.stack.to_string(),
                l.dynamic.to_string(),
                l.cardiac_phase.to_string(),
                l.echo.to_string(),
                l.location.to_string(),
                l.channel.to_string(),
                l.flow_segment.to_string(),
                l.ky.to_string(),
                l.kz.to_string(),
                l.grad.to_string(),
                l.sign.to_string(),
                l.average.to_string(),
                format!("{:.1}", l.trigger_time),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let separator: String = widths.iter().map(|w| format!("+{}", "-".repeat(w + 2))).collect::<String>() + "+\n";
    out.push_str(&separator);
    for (h, w) in HEADERS.iter().zip(widths.iter()) {
        let _ = write!(out, "| {:>w$} ", h, w = w);
    }
    out.push_str("|\n");
    out.push_str(&separator);
    for row in &rows {
        for (cell, w) in row.iter().zip(widths.iter()) {
            let _ = write!(out, "| {:>w$} ", cell, w = w);
        }
        out.push_str("|\n");
    }
    out.push_str(&separator);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(mix: u16, stack: u16, ky: i32) -> Label {
        Label { mix, stack, ky, ..Label::default() }
    }

    #[test]
    fn test_selection_matches() {
        let criteria = SelectionCriteria::for_iteration(1, 0);
        assert!(criteria.matches(&label(1, 0, 5)));
        assert!(!criteria.matches(&label(0, 0, 5)));
        assert!(!criteria.matches(&label(1, 1, 5)));

        let central = criteria.with_ky(0);
        assert!(central.matches(&label(1, 0, 0)));
        assert!(!central.matches(&label(1, 0, 5)));
        // the original criteria is unchanged
        assert!(criteria.matches(&label(1, 0, 5)));
    }

    #[test]
    fn test_selection_type_filter() {
        let mut l = label(0, 0, 0);
        l.typ = LabelType::EchoPhase;
        let criteria = SelectionCriteria::for_iteration(0, 0);
        assert!(!criteria.matches(&l));
        assert!(criteria.with_type(LabelType::EchoPhase).matches(&l));
    }

    #[test]
    fn test_relabel_rejected_then_select() {
        let mut rejected = label(0, 0, 0);
        rejected.typ = LabelType::Rejected;
        let labels = vec![label(0, 0, 1), rejected];

        let criteria = SelectionCriteria::default().with_ky(0);
        assert_eq!(labels.iter().filter(|l| criteria.matches(l)).count(), 0);

        let relabeled = relabel_rejected(&labels);
        assert_eq!(relabeled.iter().filter(|l| criteria.matches(l)).count(), 1);
        // input set untouched
        assert_eq!(labels[1].typ, LabelType::Rejected);
    }

    #[test]
    fn test_inventory_iterations() {
        let labels = vec![label(1, 2, 0), label(0, 2, 0), label(0, 0, 0), label(1, 0, 0)];
        let inv = LabelInventory::from_labels(&labels);
        assert_eq!(inv.mixes, vec![0, 1]);
        assert_eq!(inv.stacks, vec![0, 2]);
        assert_eq!(inv.iterations(), vec![(0, 0), (0, 2), (1, 0), (1, 2)]);
    }

    #[test]
    fn test_label_table_has_row_per_label() {
        let labels = vec![label(0, 0, -3), label(0, 0, 4)];
        let table = format_label_table(&labels);
        // 3 separators + header + 2 rows
        assert_eq!(table.lines().count(), 6);
        assert!(table.contains("-3"));
    }
}
