//! Incremental aggregate functions.
//!
//! Each accumulator carries its own running state and advances by one row
//! per call, so windows never have to rematerialize their buffer to produce
//! aggregate values.

use vetra_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    StdDev,
}

impl IncFunc {
    pub fn name(&self) -> &'static str {
        match self {
            IncFunc::Count => "count",
            IncFunc::Sum => "sum",
            IncFunc::Avg => "avg",
            IncFunc::Min => "min",
            IncFunc::Max => "max",
            IncFunc::First => "first",
            IncFunc::Last => "last",
            IncFunc::StdDev => "stddev",
        }
    }

    pub fn parse(name: &str) -> Option<IncFunc> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(IncFunc::Count),
            "sum" => Some(IncFunc::Sum),
            "avg" => Some(IncFunc::Avg),
            "min" => Some(IncFunc::Min),
            "max" => Some(IncFunc::Max),
            "first" => Some(IncFunc::First),
            "last" => Some(IncFunc::Last),
            "stddev" => Some(IncFunc::StdDev),
            _ => None,
        }
    }
}

/// One aggregate column: `alias = func(field)`.
#[derive(Debug, Clone)]
pub struct AggField {
    pub alias: String,
    pub func: IncFunc,
    /// Field the aggregate reads; `None` for row-counting aggregates.
    pub field: Option<String>,
}

impl AggField {
    pub fn new(alias: impl Into<String>, func: IncFunc, field: Option<String>) -> Self {
        Self {
            alias: alias.into(),
            func,
            field,
        }
    }
}

/// Running state for one aggregate over one dimension of one window.
#[derive(Debug, Clone)]
pub struct Accumulator {
    func: IncFunc,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    // Welford
    mean: f64,
    m2: f64,
    first: Option<Value>,
    last: Option<Value>,
}

impl Accumulator {
    pub fn new(func: IncFunc) -> Self {
        Self {
            func,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            first: None,
            last: None,
        }
    }

    /// Advance by one row. `value` is the row's field value, absent for
    /// missing fields (numeric aggregates skip those rows).
    pub fn step(&mut self, value: Option<&Value>) {
        match self.func {
            IncFunc::Count => {
                self.count += 1;
            }
            IncFunc::First => {
                if self.first.is_none() {
                    self.first = value.cloned();
                }
            }
            IncFunc::Last => {
                if value.is_some() {
                    self.last = value.cloned();
                }
            }
            _ => {
                let Some(n) = value.and_then(|v| v.as_float()).filter(|n| !n.is_nan()) else {
                    return;
                };
                self.count += 1;
                self.sum += n;
                if n < self.min {
                    self.min = n;
                }
                if n > self.max {
                    self.max = n;
                }
                let delta = n - self.mean;
                self.mean += delta / self.count as f64;
                self.m2 += delta * (n - self.mean);
            }
        }
    }

    /// Current running value.
    pub fn value(&self) -> Value {
        match self.func {
            IncFunc::Count => Value::Int(self.count as i64),
            IncFunc::Sum => Value::Float(self.sum),
            IncFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            IncFunc::Min => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.min)
                }
            }
            IncFunc::Max => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.max)
                }
            }
            IncFunc::First => self.first.clone().unwrap_or(Value::Null),
            IncFunc::Last => self.last.clone().unwrap_or(Value::Null),
            IncFunc::StdDev => {
                if self.count < 2 {
                    Value::Null
                } else {
                    Value::Float((self.m2 / (self.count - 1) as f64).sqrt())
                }
            }
        }
    }
}
