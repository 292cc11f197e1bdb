use serde_json::Value;

use std::fmt::{self, Display, Write};

type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub existing: Option<&'a Value>,
    pub desired: Option<&'a Value>,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Diff at path: '{}', existing: ", self.path)?;
        write_opt(f, self.existing)?;
        f.write_str(", desired: ")?;
        write_opt(f, self.desired)
    }
}

fn write_opt(f: &mut fmt::Formatter, value: Option<&Value>) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{}", v),
        None => f.write_str("<missing>"),
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn non_empty(&self) -> bool {
        !self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// true if every difference is below the top-level `field`
    pub fn only_under(&self, field: &str) -> bool {
        let prefix = format!("/{}", field);
        self.0.iter().all(|d| {
            d.path == prefix || d.path.starts_with(&format!("{}/", prefix))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diff<'a>> {
        self.0.iter()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "{} differences: ", self.0.len())?;
            for (i, diff) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                Display::fmt(diff, f)?;
            }
            Ok(())
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Compares two json values, each representing an object, under the equality that the sync pass
/// uses to decide whether a write is needed. Unlike plain `==`, a `null`, an empty object, an
/// empty array and a missing key are all equal to each other, so that an api server dropping an
/// empty map does not cause an endless stream of no-op writes. Arrays are compared in order.
/// `metadata.resourceVersion` and the other server-populated metadata are ignored.
pub fn compare_values<'a>(existing: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, Some(existing), Some(desired));
    Diffs(diffs)
}

pub fn semantic_eq(existing: &Value, desired: &Value) -> bool {
    compare_values(existing, desired).is_empty()
}

const SERVER_POPULATED: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(o)) => o.values().all(|v| is_empty_value(Some(v))),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: Option<&'a Value>,
    desired: Option<&'a Value>,
) {
    if is_empty_value(existing) && is_empty_value(desired) {
        return;
    }
    match (existing, desired) {
        (Some(Value::Object(existing_map)), Some(Value::Object(desired_map))) => {
            compare_objects(diffs, path, existing_map, desired_map);
        }
        (Some(Value::Array(existing_array)), Some(Value::Array(desired_array)))
            if existing_array.len() == desired_array.len() =>
        {
            for (i, (e, d)) in existing_array.iter().zip(desired_array.iter()).enumerate() {
                path.push(Segment::Index(i));
                compare(diffs, path, Some(e), Some(d));
                path.pop();
            }
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn compare_objects<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a JsonObject,
    desired: &'a JsonObject,
) {
    let in_metadata = path.len() == 1 && matches!(path[0], Segment::Key("metadata"));
    let keys = existing
        .keys()
        .chain(desired.keys().filter(|k| !existing.contains_key(k.as_str())));
    for key in keys {
        if in_metadata && SERVER_POPULATED.contains(&key.as_str()) {
            continue;
        }
        path.push(Segment::Key(key.as_str()));
        compare(diffs, path, existing.get(key), desired.get(key));
        path.pop();
    }
}

fn diff<'a>(path: &[Segment<'a>], existing: Option<&'a Value>, desired: Option<&'a Value>) -> Diff<'a> {
    Diff {
        path: make_path(path),
        existing,
        desired,
    }
}

fn make_path(segments: &[Segment]) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        match *segment {
            Segment::Key(k) => path.push_str(k),
            Segment::Index(i) => {
                let _ = write!(path, "{}", i);
            }
        }
    }
    path
}
