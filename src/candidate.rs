use crate::Error;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc};

#[derive(Debug, PartialEq)]
struct CandidateInner {
    // value scored by predicates
    primary: String,
    // opaque data carried along with composite candidates
    payload: Vec<Value>,
    // JSON value the candidate was constructed from
    json: Option<Value>,
}

/// Single selectable item
///
/// Either a scalar or a composite, where the first element is the primary
/// matchable value and the rest is an opaque payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    inner: Arc<CandidateInner>,
}

impl Candidate {
    /// Scalar candidate
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CandidateInner {
                primary: primary.into(),
                payload: Vec::new(),
                json: None,
            }),
        }
    }

    /// Composite candidate with payload
    pub fn composite(primary: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(CandidateInner {
                primary: primary.into(),
                payload,
                json: None,
            }),
        }
    }

    /// Primary matchable value
    pub fn primary(&self) -> &str {
        &self.inner.primary
    }

    /// Payload of the composite candidate (empty for scalars)
    pub fn payload(&self) -> &[Value] {
        &self.inner.payload
    }

    pub fn is_composite(&self) -> bool {
        !self.inner.payload.is_empty()
    }

    pub fn to_json(&self) -> Value {
        if let Some(json) = &self.inner.json {
            return json.clone();
        }
        if self.inner.payload.is_empty() {
            Value::String(self.inner.primary.clone())
        } else {
            let mut items = Vec::with_capacity(self.inner.payload.len() + 1);
            items.push(Value::String(self.inner.primary.clone()));
            items.extend(self.inner.payload.iter().cloned());
            Value::Array(items)
        }
    }

    /// Construct candidate from JSON value
    ///
    /// - string or number: scalar candidate
    /// - `[primary, payload...]`: composite candidate
    /// - `{"entry": primary, ...}`: composite candidate, the rest of the object is the payload
    pub fn from_json(json: Value) -> Result<Self, Error> {
        let (primary, payload) = match &json {
            Value::String(string) => (string.clone(), Vec::new()),
            Value::Number(number) => (number.to_string(), Vec::new()),
            Value::Bool(value) => (value.to_string(), Vec::new()),
            Value::Array(items) => {
                let (primary, payload) = items
                    .split_first()
                    .ok_or_else(|| Error::config("composite candidate can not be empty"))?;
                (scalar_to_string(primary)?, payload.to_vec())
            }
            Value::Object(map) => {
                let entry = map
                    .get("entry")
                    .ok_or_else(|| Error::config("entry attribute must be present"))?;
                let payload = map
                    .iter()
                    .filter(|(name, _)| name.as_str() != "entry")
                    .map(|(_, value)| value.clone())
                    .collect();
                (scalar_to_string(entry)?, payload)
            }
            Value::Null => return Err(Error::config("candidate can not be null")),
        };
        Ok(Self {
            inner: Arc::new(CandidateInner {
                primary,
                payload,
                json: Some(json),
            }),
        })
    }
}

fn scalar_to_string(value: &Value) -> Result<String, Error> {
    match value {
        Value::String(string) => Ok(string.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(value) => Ok(value.to_string()),
        _ => Err(Error::config(format!(
            "primary value must be a scalar: {}",
            value
        ))),
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.primary)
    }
}

impl<'a> From<&'a str> for Candidate {
    fn from(primary: &'a str) -> Self {
        Candidate::new(primary)
    }
}

impl From<String> for Candidate {
    fn from(primary: String) -> Self {
        Candidate::new(primary)
    }
}

impl Serialize for Candidate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Candidate::from_json(value).map_err(serde::de::Error::custom)
    }
}

/// Random access array of candidates
///
/// Physical length (capacity) might be larger than the logical length, trailing
/// slots are reserved for the streaming growth and are never indexed.
#[derive(Clone, Debug, Default)]
pub struct CandidateArray {
    slots: Vec<Option<Candidate>>,
    len: usize,
}

impl CandidateArray {
    pub fn new(items: Vec<Candidate>) -> Self {
        let len = items.len();
        Self {
            slots: items.into_iter().map(Some).collect(),
            len,
        }
    }

    /// Empty array with pre-allocated slots
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    /// Array from raw slots, logical length is the count of contiguous
    /// non-empty slots from the start
    pub fn from_slots(slots: Vec<Option<Candidate>>) -> Self {
        let len = slots.iter().take_while(|slot| slot.is_some()).count();
        Self { slots, len }
    }

    /// Logical length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical length
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, position: usize) -> Option<&Candidate> {
        if position >= self.len {
            return None;
        }
        self.slots[position].as_ref()
    }

    /// Iterator over logical part of the array
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> + '_ {
        self.slots[..self.len].iter().flatten()
    }

    /// Write candidate into the next free slot
    ///
    /// Capacity is doubled once the write cursor reaches it, existing slots
    /// are moved into the new storage in order.
    pub fn push(&mut self, candidate: Candidate) {
        if self.len >= self.slots.len() {
            let capacity = (self.slots.len() * 2).max(1);
            let mut slots = Vec::with_capacity(capacity);
            slots.append(&mut self.slots);
            slots.resize(capacity, None);
            self.slots = slots;
        }
        self.slots[self.len] = Some(candidate);
        self.len += 1;
    }
}

impl FromIterator<Candidate> for CandidateArray {
    fn from_iter<T: IntoIterator<Item = Candidate>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl From<Vec<Candidate>> for CandidateArray {
    fn from(items: Vec<Candidate>) -> Self {
        Self::new(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Error;
    use serde_json::json;

    #[test]
    fn test_json_candidate() -> Result<(), Error> {
        let candidate = Candidate::from_json(json!("one two"))?;
        assert_eq!(candidate.primary(), "one two");
        assert!(!candidate.is_composite());

        let candidate = Candidate::from_json(json!(42))?;
        assert_eq!(candidate.primary(), "42");

        let candidate = Candidate::from_json(json!(["main.rs", 10, {"line": 3}]))?;
        assert_eq!(candidate.primary(), "main.rs");
        assert_eq!(candidate.payload(), &[json!(10), json!({"line": 3})]);

        let candidate = Candidate::from_json(json!({"entry": "lib.rs", "path": "/src"}))?;
        assert_eq!(candidate.primary(), "lib.rs");
        assert_eq!(candidate.payload(), &[json!("/src")]);
        assert_eq!(candidate.to_json(), json!({"entry": "lib.rs", "path": "/src"}));

        assert!(Candidate::from_json(json!([])).is_err());
        assert!(Candidate::from_json(json!({"path": "/src"})).is_err());
        assert!(Candidate::from_json(Value::Null).is_err());

        let candidates: Vec<Candidate> = serde_json::from_str(r#"["a", ["b", 1]]"#)?;
        assert_eq!(candidates[1].primary(), "b");
        assert_eq!(serde_json::to_string(&candidates)?, r#"["a",["b",1]]"#);

        Ok(())
    }

    #[test]
    fn test_from_slots() {
        let array = CandidateArray::from_slots(vec![
            Some("one".into()),
            Some("two".into()),
            None,
            Some("four".into()),
        ]);
        assert_eq!(array.len(), 2);
        assert_eq!(array.capacity(), 4);
        assert!(array.get(3).is_none());
        assert_eq!(
            array.iter().map(Candidate::primary).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
    }

    #[test]
    fn test_growth() {
        for capacity in [0, 1, 3, 16] {
            let mut array = CandidateArray::with_capacity(capacity);
            for index in 0..37 {
                array.push(Candidate::new(index.to_string()));
            }
            assert_eq!(array.len(), 37);
            assert!(array.capacity() >= 37);
            let items: Vec<_> = array.iter().map(|c| c.primary().to_owned()).collect();
            let expected: Vec<_> = (0..37).map(|i: usize| i.to_string()).collect();
            assert_eq!(items, expected);
        }

        let mut array = CandidateArray::with_capacity(2);
        array.push("a".into());
        array.push("b".into());
        assert_eq!(array.capacity(), 2);
        array.push("c".into());
        assert_eq!(array.capacity(), 4);
    }
}
