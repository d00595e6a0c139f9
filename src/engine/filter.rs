use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::engine::task::{Task, TIMESTAMP_FORMAT};
use crate::error::{Result, ScrapeError};

/// Task column a filter condition looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterField {
    Url,
    Selector,
    Status,
    LastRun,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Selector => "selector",
            Self::Status => "status",
            Self::LastRun => "last_run",
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "url" => Ok(Self::Url),
            "selector" => Ok(Self::Selector),
            "status" => Ok(Self::Status),
            "last_run" => Ok(Self::LastRun),
            other => Err(format!("unknown filter field: {}", other)),
        }
    }
}

/// Case-insensitive row filter.
///
/// Values given for the same field are alternatives, distinct fields must all
/// match. Selectors match one of their comma separated parts exactly, the
/// other fields match on substrings. An empty filter matches every task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    conditions: BTreeMap<FilterField, Vec<String>>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: FilterField, value: impl AsRef<str>) -> Self {
        self.push(field, value);
        self
    }

    pub fn push(&mut self, field: FilterField, value: impl AsRef<str>) {
        self.conditions
            .entry(field)
            .or_default()
            .push(value.as_ref().trim().to_lowercase());
    }

    /// Build a filter from `field=value` expressions
    pub fn parse<S: AsRef<str>>(expressions: &[S]) -> Result<Self> {
        let mut filter = Self::new();
        for expression in expressions {
            let expression = expression.as_ref();
            let (field, value) = expression.split_once('=').ok_or_else(|| {
                ScrapeError::ConfigParse(format!("filter must look like field=value: {}", expression))
            })?;
            let field = field.parse::<FilterField>().map_err(ScrapeError::ConfigParse)?;
            filter.push(field, value);
        }
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.conditions
            .iter()
            .all(|(field, values)| field_matches(*field, values, task))
    }
}

fn field_matches(field: FilterField, values: &[String], task: &Task) -> bool {
    let cell = match field {
        FilterField::Url => task.url.to_lowercase(),
        FilterField::Selector => task.selector.to_lowercase(),
        FilterField::Status => task.status.as_str().to_lowercase(),
        FilterField::LastRun => task
            .last_run
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default(),
    };

    if field == FilterField::Selector {
        let parts: Vec<&str> = cell.split(',').map(str::trim).collect();
        return values.iter().any(|v| parts.contains(&v.as_str()));
    }
    values.iter().any(|v| cell.contains(v.as_str()))
}
