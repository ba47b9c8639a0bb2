use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// SourceId – an independent, unit-variance uncertainty source
// ---------------------------------------------------------------------------

/// Identity of one independent uncertainty source.
///
/// Every quantity is decomposed linearly over these sources, so the
/// covariance of two quantities is the dot product of their decompositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceId {
    /// A named constant, by declaration index.
    Constant(usize),
    /// One raw sample: block index, channel index, cycle position.
    Sample {
        block: usize,
        channel: usize,
        cycle: usize,
    },
    /// Uncertainty a statistic reports beyond what its inputs explain
    /// (scatter-based errors, Monte Carlo spread).
    Derived {
        step: usize,
        block: Option<usize>,
        cycle: Option<usize>,
        seq: u32,
    },
}

// ---------------------------------------------------------------------------
// Terms – sparse linear decomposition, sorted by source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Terms(Vec<(SourceId, f64)>);

impl Terms {
    pub fn none() -> Self {
        Terms(Vec::new())
    }

    pub fn single(source: SourceId, coef: f64) -> Self {
        if coef == 0.0 {
            Terms::none()
        } else {
            Terms(vec![(source, coef)])
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SourceId, f64)> {
        self.0.iter()
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.0.iter().map(|(s, _)| *s)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `a·x + b·y`, merging the two sorted lists.
    pub fn combine(x: &Terms, a: f64, y: &Terms, b: f64) -> Terms {
        let mut out = Vec::with_capacity(x.0.len() + y.0.len());
        let (mut i, mut j) = (0, 0);
        while i < x.0.len() || j < y.0.len() {
            let next = match (x.0.get(i), y.0.get(j)) {
                (Some(&(sx, cx)), Some(&(sy, cy))) => match sx.cmp(&sy) {
                    std::cmp::Ordering::Less => {
                        i += 1;
                        (sx, a * cx)
                    }
                    std::cmp::Ordering::Greater => {
                        j += 1;
                        (sy, b * cy)
                    }
                    std::cmp::Ordering::Equal => {
                        i += 1;
                        j += 1;
                        (sx, a * cx + b * cy)
                    }
                },
                (Some(&(sx, cx)), None) => {
                    i += 1;
                    (sx, a * cx)
                }
                (None, Some(&(sy, cy))) => {
                    j += 1;
                    (sy, b * cy)
                }
                (None, None) => break,
            };
            if next.1 != 0.0 {
                out.push(next);
            }
        }
        Terms(out)
    }

    pub fn scale(&self, k: f64) -> Terms {
        if k == 0.0 {
            return Terms::none();
        }
        Terms(self.0.iter().map(|&(s, c)| (s, c * k)).collect())
    }

    /// `Σ coef_i · terms_i` over any number of decompositions.
    pub fn linear_sum<'a>(parts: impl IntoIterator<Item = (&'a Terms, f64)>) -> Terms {
        let mut acc: BTreeMap<SourceId, f64> = BTreeMap::new();
        for (terms, k) in parts {
            if k == 0.0 {
                continue;
            }
            for &(s, c) in &terms.0 {
                *acc.entry(s).or_insert(0.0) += k * c;
            }
        }
        Terms(acc.into_iter().filter(|(_, c)| *c != 0.0).collect())
    }

    /// Append a source that is not already present. Keeps the list sorted.
    pub fn with_source(mut self, source: SourceId, coef: f64) -> Terms {
        if coef != 0.0 {
            match self.0.binary_search_by(|(s, _)| s.cmp(&source)) {
                Ok(i) => self.0[i].1 += coef,
                Err(i) => self.0.insert(i, (source, coef)),
            }
        }
        self
    }

    pub fn dot(&self, other: &Terms) -> f64 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0;
        while i < self.0.len() && j < other.0.len() {
            let (sa, ca) = self.0[i];
            let (sb, cb) = other.0[j];
            match sa.cmp(&sb) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += ca * cb;
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }

    pub fn norm_sq(&self) -> f64 {
        self.0.iter().map(|(_, c)| c * c).sum()
    }

    /// Coefficient of one source, zero if absent.
    pub fn coefficient(&self, source: SourceId) -> f64 {
        self.0
            .binary_search_by(|(s, _)| s.cmp(&source))
            .map(|i| self.0[i].1)
            .unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Quantity – value, one-sigma uncertainty and its decomposition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub sigma: f64,
    pub terms: Terms,
}

impl Quantity {
    /// An exact value (literals, counts).
    pub fn exact(value: f64) -> Self {
        Quantity {
            value,
            sigma: 0.0,
            terms: Terms::none(),
        }
    }

    /// A quantity whose whole uncertainty comes from one independent source.
    pub fn measured(value: f64, sigma: f64, source: SourceId) -> Self {
        let sigma = sigma.abs();
        Quantity {
            value,
            sigma,
            terms: Terms::single(source, sigma),
        }
    }

    pub fn variance(&self) -> f64 {
        self.sigma * self.sigma
    }

    /// Covariance with another quantity, from the shared sources.
    pub fn covariance(&self, other: &Quantity) -> f64 {
        self.terms.dot(&other.terms)
    }

    /// Attach a private source for any variance the decomposition does not
    /// account for.
    pub fn with_residual(mut self, source: SourceId) -> Self {
        let excess = self.variance() - self.terms.norm_sq();
        if excess > f64::EPSILON * self.variance() && excess > 0.0 {
            self.terms = self.terms.with_source(source, excess.sqrt());
        }
        self
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ± {}", self.value, self.sigma)
    }
}

// ---------------------------------------------------------------------------
// Series – values along one axis with inclusion
// ---------------------------------------------------------------------------

/// What a series is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Cycles,
    Blocks,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Cycles => f.write_str("per-cycle"),
            Axis::Blocks => f.write_str("per-block"),
        }
    }
}

/// `None` marks an excluded element (user-rejected or screened out).
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub axis: Axis,
    pub items: Vec<Option<Quantity>>,
}

impl Series {
    pub fn new(axis: Axis, items: Vec<Option<Quantity>>) -> Self {
        Series { axis, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Included elements with their positions.
    pub fn included(&self) -> impl Iterator<Item = (usize, &Quantity)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.as_ref().map(|q| (i, q)))
    }

    pub fn included_count(&self) -> usize {
        self.items.iter().filter(|q| q.is_some()).count()
    }
}

/// A runtime value: one quantity or a series of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Scalar(Quantity),
    Series(Series),
}

impl Operand {
    pub fn describe(&self) -> String {
        match self {
            Operand::Scalar(_) => "scalar".to_string(),
            Operand::Series(s) => format!("{} series", s.axis),
        }
    }
}
