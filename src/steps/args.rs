//! Positional step arguments as sent with `invoke`
//!
//! The runner passes captured groups back as strings, followed by an
//! optional data table (an array of rows).

use serde_json::Value;

use crate::common::{Error, Result};
use crate::wire::protocol::integer_value;

/// Arguments of one `invoke`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs {
    values: Vec<Value>,
}

impl StepArgs {
    /// Wrap the raw `args` value; null means no arguments, a scalar is one argument
    pub fn from_value(value: Value) -> Self {
        let values = match value {
            Value::Null => Vec::new(),
            Value::Array(values) => values,
            other => vec![other],
        };
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Required string argument
    pub fn string(&self, index: usize) -> Result<&str> {
        match self.values.get(index) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(Error::argument(index, "expected a string")),
            None => Err(Error::argument(index, "missing")),
        }
    }

    /// Required integer argument, from a number or a numeric string
    pub fn integer(&self, index: usize) -> Result<i64> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| Error::argument(index, "missing"))?;
        integer_value(value).ok_or_else(|| Error::argument(index, "expected an integer"))
    }

    /// Required TCP port argument
    pub fn port(&self, index: usize) -> Result<u16> {
        let value = self.integer(index)?;
        u16::try_from(value)
            .map_err(|_| Error::argument(index, format!("{} is not a valid port", value)))
    }

    /// Data table as `(key, value)` rows
    ///
    /// Rows that are not at least two strings are skipped. A missing table
    /// is empty; anything other than an array is an error.
    pub fn table(&self, index: usize) -> Result<Vec<(String, String)>> {
        let rows = match self.values.get(index) {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(rows)) => rows,
            Some(_) => return Err(Error::argument(index, "expected a table")),
        };

        Ok(rows
            .iter()
            .filter_map(|row| {
                let key = row.get(0)?.as_str()?;
                let value = row.get(1)?.as_str()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shapes() {
        assert!(StepArgs::from_value(Value::Null).is_empty());
        assert_eq!(StepArgs::from_value(json!("a")).len(), 1);
        assert_eq!(StepArgs::from_value(json!(["a", "b"])).len(), 2);
    }

    #[test]
    fn test_strings_and_integers() {
        let args = StepArgs::from_value(json!(["a", "1234", 12.4, "x"]));
        assert_eq!(args.string(0).unwrap(), "a");
        assert_eq!(args.integer(1).unwrap(), 1234);
        assert_eq!(args.integer(2).unwrap(), 12);
        assert!(matches!(
            args.integer(3),
            Err(Error::StepArgument { index: 3, .. })
        ));
        assert!(matches!(
            args.string(2),
            Err(Error::StepArgument { index: 2, .. })
        ));
        assert!(args.string(9).is_err());
    }

    #[test]
    fn test_port_range() {
        let args = StepArgs::from_value(json!(["31221", "70000", "-1"]));
        assert_eq!(args.port(0).unwrap(), 31221);
        assert!(args.port(1).is_err());
        assert!(args.port(2).is_err());
    }

    #[test]
    fn test_table() {
        let args = StepArgs::from_value(json!([
            "a",
            [["name", "web01"], ["state", 0], ["only"], ["output", "OK", "extra"]],
            "not a table"
        ]));
        assert_eq!(
            args.table(1).unwrap(),
            vec![
                ("name".to_string(), "web01".to_string()),
                ("output".to_string(), "OK".to_string()),
            ]
        );
        assert!(args.table(5).unwrap().is_empty());
        assert!(args.table(2).is_err());
    }
}
