//! Serializable selections and projections.
//!
//! Workers never receive code, only descriptors: a [`Projection`] says which
//! columns (optionally scaled) form the histogram coordinates and which column
//! carries the event weight; a [`Selection`] says which events count as
//! accepted and which as rejected. Both are plain data and are resolved
//! against each event inside the worker.
//!
//! Cuts have a small text form, a conjunction of comparisons:
//!
//! ```
//! use calibflow::selection::Cut;
//!
//! let cut = Cut::parse("hasRich && ProbNNk > 0.4 && P/1000 < 150")?;
//! assert_eq!(cut.conditions().len(), 3);
//! # Ok::<(), calibflow::ConfigError>(())
//! ```

use crate::error::ConfigError;
use crate::source::Event;
use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static CONDITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(!?)\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(?:([*/])\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?))?\s*(?:(<=|>=|==|!=|<|>)\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?))?\s*$",
    )
    .expect("condition regex is valid")
});

/// A column, optionally multiplied by a constant (`P/1000` is `P` scaled by `0.001`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisExpr {
    pub column: String,
    pub scale: f64,
}

impl AxisExpr {
    #[must_use]
    pub fn column(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn scaled(column: impl Into<String>, scale: f64) -> Self {
        Self {
            column: column.into(),
            scale,
        }
    }

    /// Parse `name`, `name*k` or `name/k`.
    ///
    /// # Errors
    /// [`ConfigError::InvalidCut`] on anything else, or division by zero.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let caps = CONDITION_RE
            .captures(text)
            .filter(|c| c.get(1).is_some_and(|m| m.as_str().is_empty()) && c.get(5).is_none())
            .ok_or_else(|| ConfigError::InvalidCut(text.to_string()))?;
        axis_from_captures(&caps, text)
    }

    /// # Errors
    /// Fails if the event lacks the column.
    pub fn eval(&self, event: &Event) -> Result<f64> {
        event
            .get(&self.column)
            .map(|v| v * self.scale)
            .ok_or_else(|| anyhow!("missing column '{}'", self.column))
    }
}

impl fmt::Display for AxisExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if (self.scale - 1.0).abs() < f64::EPSILON {
            write!(f, "{}", self.column)
        } else {
            write!(f, "{}*{}", self.column, self.scale)
        }
    }
}

fn axis_from_captures(caps: &regex::Captures<'_>, text: &str) -> Result<AxisExpr, ConfigError> {
    let invalid = || ConfigError::InvalidCut(text.to_string());
    let scale = match (caps.get(3), caps.get(4)) {
        (Some(op), Some(k)) => {
            let k: f64 = k.as_str().parse().map_err(|_| invalid())?;
            if op.as_str() == "/" {
                if k == 0.0 {
                    return Err(invalid());
                }
                1.0 / k
            } else {
                k
            }
        }
        _ => 1.0,
    };
    Ok(AxisExpr::scaled(&caps[2], scale))
}

/// Comparison operator of a [`Condition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Cmp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "<" => Cmp::Lt,
            "<=" => Cmp::Le,
            ">" => Cmp::Gt,
            ">=" => Cmp::Ge,
            "==" => Cmp::Eq,
            "!=" => Cmp::Ne,
            _ => return None,
        })
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
            Cmp::Eq => "==",
            Cmp::Ne => "!=",
        }
    }
}

/// `expr op value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub expr: AxisExpr,
    pub op: Cmp,
    pub value: f64,
}

impl Condition {
    #[must_use]
    pub fn new(column: impl Into<String>, op: Cmp, value: f64) -> Self {
        Self {
            expr: AxisExpr::column(column),
            op,
            value,
        }
    }

    /// # Errors
    /// Fails if the event lacks the column.
    pub fn eval(&self, event: &Event) -> Result<bool> {
        Ok(self.op.holds(self.expr.eval(event)?, self.value))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.expr, self.op.symbol(), self.value)
    }
}

/// A conjunction of conditions. The empty cut accepts everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cut {
    conditions: Vec<Condition>,
}

impl Cut {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Parse `a > 1 && b && !c`. A bare column means `column != 0`, a negated
    /// one `column == 0`. Empty or blank text is the empty cut.
    ///
    /// # Errors
    /// [`ConfigError::InvalidCut`] if any term does not parse.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::all());
        }
        let mut conditions = Vec::new();
        for term in text.split("&&") {
            let caps = CONDITION_RE
                .captures(term)
                .ok_or_else(|| ConfigError::InvalidCut(term.trim().to_string()))?;
            let negated = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let expr = axis_from_captures(&caps, term.trim())?;
            let condition = match (caps.get(5), caps.get(6)) {
                (Some(op), Some(v)) if !negated => Condition {
                    expr,
                    op: Cmp::parse(op.as_str())
                        .ok_or_else(|| ConfigError::InvalidCut(term.trim().to_string()))?,
                    value: v
                        .as_str()
                        .parse()
                        .map_err(|_| ConfigError::InvalidCut(term.trim().to_string()))?,
                },
                (None, None) => Condition {
                    expr,
                    op: if negated { Cmp::Eq } else { Cmp::Ne },
                    value: 0.0,
                },
                _ => return Err(ConfigError::InvalidCut(term.trim().to_string())),
            };
            conditions.push(condition);
        }
        Ok(Self { conditions })
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(&self, other: &Cut) -> Cut {
        let mut conditions = self.conditions.clone();
        conditions.extend(other.conditions.iter().cloned());
        Cut { conditions }
    }

    /// # Errors
    /// Fails if the event lacks a referenced column.
    pub fn eval(&self, event: &Event) -> Result<bool> {
        for c in &self.conditions {
            if !c.eval(event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Cut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return write!(f, "<all>");
        }
        let parts: Vec<String> = self.conditions.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" && "))
    }
}

/// Accepted / rejected partition of the events passing `cuts`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub accepted: Cut,
    pub rejected: Cut,
    pub cuts: Cut,
}

impl Selection {
    #[must_use]
    pub fn new(accepted: Cut, rejected: Cut) -> Self {
        Self {
            accepted,
            rejected,
            cuts: Cut::all(),
        }
    }

    /// Complementary cuts on one column: accepted `> value`, rejected `<= value`.
    #[must_use]
    pub fn threshold(column: impl Into<String>, value: f64) -> Self {
        let column = column.into();
        Self::new(
            Cut::new(vec![Condition::new(column.clone(), Cmp::Gt, value)]),
            Cut::new(vec![Condition::new(column, Cmp::Le, value)]),
        )
    }

    /// Parse both sides from text.
    ///
    /// # Errors
    /// [`ConfigError::InvalidCut`] if either side does not parse.
    pub fn parse(accepted: &str, rejected: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Cut::parse(accepted)?, Cut::parse(rejected)?))
    }

    #[must_use]
    pub fn with_cuts(mut self, cuts: Cut) -> Self {
        self.cuts = cuts;
        self
    }

    /// Effective accepted selection, `cuts && accepted`.
    #[must_use]
    pub fn effective_accepted(&self) -> Cut {
        self.cuts.and(&self.accepted)
    }

    /// Effective rejected selection, `cuts && rejected`.
    #[must_use]
    pub fn effective_rejected(&self) -> Cut {
        self.cuts.and(&self.rejected)
    }

    /// Classify one event: `Some(true)` accepted, `Some(false)` rejected,
    /// `None` neither. An event passing both sides counts as accepted.
    ///
    /// # Errors
    /// Fails if the event lacks a referenced column.
    pub fn classify(&self, event: &Event) -> Result<Option<bool>> {
        if !self.cuts.eval(event)? {
            return Ok(None);
        }
        if self.accepted.eval(event)? {
            return Ok(Some(true));
        }
        if self.rejected.eval(event)? {
            return Ok(Some(false));
        }
        Ok(None)
    }
}

/// Histogram coordinates and event weight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub axes: Vec<AxisExpr>,
    pub weight: Option<String>,
}

impl Projection {
    #[must_use]
    pub fn new(axes: Vec<AxisExpr>) -> Self {
        Self { axes, weight: None }
    }

    /// Parse axis expressions such as `["P/1000", "ETA", "nTracks"]`.
    ///
    /// # Errors
    /// [`ConfigError::InvalidCut`] on a malformed expression.
    pub fn parse<S: AsRef<str>>(axes: &[S]) -> Result<Self, ConfigError> {
        let axes = axes
            .iter()
            .map(|a| AxisExpr::parse(a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(axes))
    }

    #[must_use]
    pub fn with_weight(mut self, column: impl Into<String>) -> Self {
        self.weight = Some(column.into());
        self
    }

    /// Coordinates of one event, in axis order.
    ///
    /// # Errors
    /// Fails if the event lacks an axis column.
    pub fn coords(&self, event: &Event) -> Result<Vec<f64>> {
        self.axes.iter().map(|a| a.eval(event)).collect()
    }

    /// Event weight, `1.0` when no weight column is configured.
    ///
    /// # Errors
    /// Fails if the event lacks the weight column.
    pub fn weight(&self, event: &Event) -> Result<f64> {
        match &self.weight {
            Some(column) => event
                .get(column)
                .ok_or_else(|| anyhow!("missing weight column '{column}'")),
            None => Ok(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(values: &[(&str, f64)]) -> Event {
        Event::from_pairs(values.iter().map(|(k, v)| ((*k).to_string(), *v)))
    }

    #[test]
    fn parse_axis_expressions() {
        assert_eq!(AxisExpr::parse("ETA").unwrap(), AxisExpr::column("ETA"));
        let p = AxisExpr::parse("P/1000").unwrap();
        assert_eq!(p.column, "P");
        assert!((p.scale - 0.001).abs() < 1e-15);
        assert_eq!(AxisExpr::parse("P*2").unwrap().scale, 2.0);
        assert!(AxisExpr::parse("P/0").is_err());
        assert!(AxisExpr::parse("P > 3").is_err());
        assert!(AxisExpr::parse("1abc").is_err());
    }

    #[test]
    fn parse_cut_terms() {
        let cut = Cut::parse("hasRich && !isMuon && ProbNNk >= 0.4 && P/1000 < 1e2").unwrap();
        let c = cut.conditions();
        assert_eq!(c[0].op, Cmp::Ne);
        assert_eq!(c[1].op, Cmp::Eq);
        assert_eq!(c[2].op, Cmp::Ge);
        assert_eq!(c[2].value, 0.4);
        assert_eq!(c[3].value, 100.0);
        assert!(Cut::parse("   ").unwrap().is_empty());
        assert!(Cut::parse("x >").is_err());
        assert!(Cut::parse("!x > 3").is_err());
    }

    #[test]
    fn threshold_selection_partitions_events() {
        let sel = Selection::threshold("pid", 0.5).with_cuts(Cut::parse("hasRich").unwrap());
        let pass = event(&[("pid", 0.9), ("hasRich", 1.0)]);
        let fail = event(&[("pid", 0.1), ("hasRich", 1.0)]);
        let cut = event(&[("pid", 0.9), ("hasRich", 0.0)]);
        assert_eq!(sel.classify(&pass).unwrap(), Some(true));
        assert_eq!(sel.classify(&fail).unwrap(), Some(false));
        assert_eq!(sel.classify(&cut).unwrap(), None);
        assert!(sel.classify(&event(&[("hasRich", 1.0)])).is_err());
    }

    #[test]
    fn projection_scales_and_weights() {
        let proj = Projection::parse(&["P/1000", "ETA"]).unwrap().with_weight("sw");
        let ev = event(&[("P", 12_000.0), ("ETA", 3.1), ("sw", 0.7)]);
        let xy = proj.coords(&ev).unwrap();
        assert!((xy[0] - 12.0).abs() < 1e-12);
        assert_eq!(xy[1], 3.1);
        assert_eq!(proj.weight(&ev).unwrap(), 0.7);
    }
}
