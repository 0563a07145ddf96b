//! Plot families of metric variables.
//!
//! A variable's family is the part of its name before the first `_`
//! (`bias_of_gpp` → `bias`). Every family a report can draw is listed here
//! with its drawing options; names outside the list are never plotted.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Timeint,
    Bias,
    Rmse,
    Shift,
    Phase,
    Spaceint,
}

/// Where a family is drawn: maps share limits across models, regional time
/// series do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FamilyKind {
    Map,
    Series,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Colormap {
    Fixed(&'static str),
    /// Use the confrontation's own colormap.
    Choose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisLabel {
    Unit,
    Fixed(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FamilyDescriptor {
    pub id: &'static str,
    pub kind: FamilyKind,
    pub symmetric: bool,
    pub has_legend: bool,
    pub colormap: Colormap,
    pub label: AxisLabel,
    pub section: &'static str,
}

pub const SECTION_PERIOD_MEAN: &str = "Temporally integrated period mean";
pub const SECTION_REGIONAL_MEAN: &str = "Spatially integrated regional mean";

impl MetricFamily {
    pub const ALL: [MetricFamily; 6] = [
        MetricFamily::Timeint,
        MetricFamily::Bias,
        MetricFamily::Rmse,
        MetricFamily::Shift,
        MetricFamily::Phase,
        MetricFamily::Spaceint,
    ];

    pub fn descriptor(self) -> FamilyDescriptor {
        let map = |id, symmetric, colormap, label| FamilyDescriptor {
            id,
            kind: FamilyKind::Map,
            symmetric,
            has_legend: true,
            colormap,
            label,
            section: SECTION_PERIOD_MEAN,
        };
        match self {
            MetricFamily::Timeint => map("timeint", false, Colormap::Choose, AxisLabel::Unit),
            MetricFamily::Bias => map("bias", true, Colormap::Fixed("seismic"), AxisLabel::Unit),
            MetricFamily::Rmse => map("rmse", false, Colormap::Fixed("YlOrRd"), AxisLabel::Unit),
            MetricFamily::Shift => map(
                "shift",
                true,
                Colormap::Fixed("PRGn"),
                AxisLabel::Fixed("months"),
            ),
            MetricFamily::Phase => map(
                "phase",
                false,
                Colormap::Fixed("jet"),
                AxisLabel::Fixed("month"),
            ),
            MetricFamily::Spaceint => FamilyDescriptor {
                id: "spaceint",
                kind: FamilyKind::Series,
                symmetric: false,
                has_legend: false,
                colormap: Colormap::Choose,
                label: AxisLabel::Unit,
                section: SECTION_REGIONAL_MEAN,
            },
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.descriptor().id == id)
    }

    pub fn of_variable(name: &str) -> Option<Self> {
        Self::from_id(name.split('_').next()?)
    }

    pub fn id(self) -> &'static str {
        self.descriptor().id
    }
}

/// Display name of a per-region metric kind (the variable name before
/// `_over_<region>`).
pub fn metric_display_name(kind: &str) -> Option<&'static str> {
    let name = match kind {
        "period_mean" => "Period Mean",
        "bias" => "Bias",
        "rmse" => "RMSE",
        "shift" => "Phase Shift",
        "bias_score" => "Bias Score",
        "rmse_score" => "RMSE Score",
        "shift_score" => "Phase Score",
        "iav_score" => "Interannual Variability Score",
        "sd_score" => "Spatial Distribution Score",
        "overall_score" => "Overall Score",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_round_trip() {
        for family in MetricFamily::ALL {
            assert_eq!(MetricFamily::from_id(family.id()), Some(family));
        }
        assert_eq!(MetricFamily::of_variable("bias_of_gpp"), Some(MetricFamily::Bias));
        assert_eq!(
            MetricFamily::of_variable("spaceint_of_gpp_over_global"),
            Some(MetricFamily::Spaceint)
        );
        assert_eq!(MetricFamily::of_variable("overall_score_over_global"), None);
    }

    #[test]
    fn only_bias_and_shift_are_symmetric() {
        let symmetric: Vec<_> = MetricFamily::ALL
            .into_iter()
            .filter(|f| f.descriptor().symmetric)
            .collect();
        assert_eq!(symmetric, vec![MetricFamily::Bias, MetricFamily::Shift]);
        assert_eq!(metric_display_name("sd_score"), Some("Spatial Distribution Score"));
        assert_eq!(metric_display_name("bias_of"), None);
    }
}
