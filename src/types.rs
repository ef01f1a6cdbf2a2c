// src/types.rs

//! Small value types shared by the engine, the factories and the cache.

use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

/// Identifier of a task within one build execution.
///
/// Two start requests with equal identifiers refer to the same task; the
/// registry runs its body at most once.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(name: impl AsRef<str>) -> Self {
        TaskId(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({:?})", &*self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(Arc::from(value))
    }
}

impl From<&TaskId> for TaskId {
    fn from(value: &TaskId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Opaque, shareable result of a task body.
///
/// Results are handed to every waiter of a task, so they are reference
/// counted and immutable.
#[derive(Clone)]
pub struct TaskValue(Arc<dyn Any + Send + Sync>);

impl TaskValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        TaskValue(Arc::new(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        TaskValue::new(value.into())
    }

    pub fn unit() -> Self {
        TaskValue::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// The value as a string slice, if it holds a `String`.
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>().map(String::as_str)
    }

    pub fn ptr_eq(&self, other: &TaskValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "TaskValue({s:?})")
        } else if let Some(ids) = self.downcast_ref::<Vec<TaskId>>() {
            write!(f, "TaskValue({ids:?})")
        } else {
            f.write_str("TaskValue(..)")
        }
    }
}

/// Stable digest describing a task factory.
///
/// Equal fingerprints mean "same factory" for duplicate detection and for
/// result cache lookups.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest a list of descriptive parts.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn of<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            let bytes = part.as_ref();
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Fingerprint({})", &hex[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Built-in task kinds a plan can declare in `[task.<name>]`.
///
/// - `Constant`: returns `value`.
/// - `Await`: waits for `target` without starting it.
/// - `Concat`: waits for each of `inputs` and concatenates them after `prefix`.
/// - `Children`: starts `children` and returns immediately.
/// - `Sequential`: starts and waits for `children` one after another.
/// - `Fail`: fails with `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Constant,
    Await,
    Concat,
    Children,
    Sequential,
    Fail,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Constant => "constant",
            TaskKind::Await => "await",
            TaskKind::Concat => "concat",
            TaskKind::Children => "children",
            TaskKind::Sequential => "sequential",
            TaskKind::Fail => "fail",
        }
    }

    /// Kinds whose `children` list names other plan tasks to start.
    pub fn starts_children(&self) -> bool {
        matches!(self, TaskKind::Children | TaskKind::Sequential)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "constant" => Ok(TaskKind::Constant),
            "await" => Ok(TaskKind::Await),
            "concat" => Ok(TaskKind::Concat),
            "children" => Ok(TaskKind::Children),
            "sequential" => Ok(TaskKind::Sequential),
            "fail" => Ok(TaskKind::Fail),
            other => Err(format!(
                "invalid task kind: {other} (expected one of constant, await, concat, children, sequential, fail)"
            )),
        }
    }
}
