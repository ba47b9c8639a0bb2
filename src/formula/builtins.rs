use std::fmt;

use serde::{Deserialize, Serialize};

/// How a built-in consumes its arguments; drives the shape check and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Applied to every element, preserves the argument's shape.
    Elementwise,
    /// Reduces one series to a single value.
    Aggregate,
    /// Reduces a `(y, x)` pair of series to a fit parameter.
    Regression,
    /// Evaluates a `(y, x)` fit at a scalar abscissa.
    Prediction,
    /// Sample times of a raw channel.
    Time,
}

/// The closed set of functions the formula language knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Sqrt,
    Ln,
    Log10,
    Exp,
    Abs,
    Mean,
    WMean,
    Sum,
    Count,
    StDev,
    StErr,
    Mswd,
    FilteredMean,
    FilteredWMean,
    ChauvenetMean,
    GeoMean,
    Slope,
    Intercept,
    WSlope,
    WIntercept,
    Predict,
    WPredict,
    Time,
}

const ALL: [Builtin; 23] = [
    Builtin::Sqrt,
    Builtin::Ln,
    Builtin::Log10,
    Builtin::Exp,
    Builtin::Abs,
    Builtin::Mean,
    Builtin::WMean,
    Builtin::Sum,
    Builtin::Count,
    Builtin::StDev,
    Builtin::StErr,
    Builtin::Mswd,
    Builtin::FilteredMean,
    Builtin::FilteredWMean,
    Builtin::ChauvenetMean,
    Builtin::GeoMean,
    Builtin::Slope,
    Builtin::Intercept,
    Builtin::WSlope,
    Builtin::WIntercept,
    Builtin::Predict,
    Builtin::WPredict,
    Builtin::Time,
];

impl Builtin {
    /// Look a function up by its formula name. Names are case-sensitive.
    pub fn from_name(name: &str) -> Option<Builtin> {
        ALL.iter().copied().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Sqrt => "sqrt",
            Builtin::Ln => "ln",
            Builtin::Log10 => "log10",
            Builtin::Exp => "exp",
            Builtin::Abs => "abs",
            Builtin::Mean => "mean",
            Builtin::WMean => "wmean",
            Builtin::Sum => "sum",
            Builtin::Count => "count",
            Builtin::StDev => "stdev",
            Builtin::StErr => "sterr",
            Builtin::Mswd => "mswd",
            Builtin::FilteredMean => "filtered_mean",
            Builtin::FilteredWMean => "filtered_wmean",
            Builtin::ChauvenetMean => "chauvenet_mean",
            Builtin::GeoMean => "geomean",
            Builtin::Slope => "slope",
            Builtin::Intercept => "intercept",
            Builtin::WSlope => "wslope",
            Builtin::WIntercept => "wintercept",
            Builtin::Predict => "predict",
            Builtin::WPredict => "wpredict",
            Builtin::Time => "time",
        }
    }

    pub fn kind(self) -> BuiltinKind {
        match self {
            Builtin::Sqrt | Builtin::Ln | Builtin::Log10 | Builtin::Exp | Builtin::Abs => {
                BuiltinKind::Elementwise
            }
            Builtin::Mean
            | Builtin::WMean
            | Builtin::Sum
            | Builtin::Count
            | Builtin::StDev
            | Builtin::StErr
            | Builtin::Mswd
            | Builtin::FilteredMean
            | Builtin::FilteredWMean
            | Builtin::ChauvenetMean
            | Builtin::GeoMean => BuiltinKind::Aggregate,
            Builtin::Slope | Builtin::Intercept | Builtin::WSlope | Builtin::WIntercept => {
                BuiltinKind::Regression
            }
            Builtin::Predict | Builtin::WPredict => BuiltinKind::Prediction,
            Builtin::Time => BuiltinKind::Time,
        }
    }

    /// Exact number of arguments the function takes.
    pub fn arity(self) -> usize {
        match self.kind() {
            BuiltinKind::Elementwise | BuiltinKind::Aggregate | BuiltinKind::Time => 1,
            BuiltinKind::Regression => 2,
            BuiltinKind::Prediction => 3,
        }
    }

    pub fn all() -> &'static [Builtin] {
        &ALL
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for b in Builtin::all() {
            assert_eq!(Builtin::from_name(b.name()), Some(*b));
        }
        assert_eq!(Builtin::from_name("Sqrt"), None);
        assert_eq!(Builtin::from_name("median"), None);
    }

    #[test]
    fn arity_follows_kind() {
        assert_eq!(Builtin::Ln.arity(), 1);
        assert_eq!(Builtin::WMean.arity(), 1);
        assert_eq!(Builtin::Slope.arity(), 2);
        assert_eq!(Builtin::WPredict.arity(), 3);
    }
}
