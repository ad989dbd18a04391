//! DAP-facing ids for frames and variable containers. Ids are valid for one
//! stop only; [`StopCache::invalidate`] drops every mapping while the counters
//! keep counting, so an id handed out before a resume never resolves again.

use std::collections::HashMap;

use pyrite_wire::{FrameId, FrameInfo, ThreadId, ThreadInfo, VariableInfo, VariableRef};
use serde::Serialize;

#[derive(Debug)]
struct HandleTable<T> {
    next: i64,
    map: HashMap<i64, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    fn alloc(&mut self, value: T) -> i64 {
        self.next += 1;
        let id = self.next;
        self.map.insert(id, value);
        id
    }

    fn get(&self, id: i64) -> Option<&T> {
        self.map.get(&id)
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// What a DAP `variablesReference` expands to on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableContainer {
    Locals(FrameId),
    Children(VariableRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapVariable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

#[derive(Debug, Clone)]
pub struct StackEntry {
    pub id: i64,
    pub frame: FrameInfo,
}

#[derive(Debug, Default)]
pub struct StopCache {
    /// DAP frame id to the server's frame id.
    frames: HandleTable<FrameId>,
    containers: HandleTable<VariableContainer>,
    threads: Option<Vec<ThreadInfo>>,
    stacks: HashMap<ThreadId, Vec<StackEntry>>,
    locals: HashMap<i64, i64>,
    children: HashMap<i64, Vec<DapVariable>>,
}

impl StopCache {
    pub fn invalidate(&mut self) {
        self.frames.clear();
        self.containers.clear();
        self.threads = None;
        self.stacks.clear();
        self.locals.clear();
        self.children.clear();
    }

    pub fn threads(&self) -> Option<&[ThreadInfo]> {
        self.threads.as_deref()
    }

    pub fn store_threads(&mut self, threads: Vec<ThreadInfo>) -> &[ThreadInfo] {
        self.threads.insert(threads)
    }

    pub fn stack(&self, thread_id: ThreadId) -> Option<&[StackEntry]> {
        self.stacks.get(&thread_id).map(Vec::as_slice)
    }

    pub fn store_stack(&mut self, thread_id: ThreadId, frames: Vec<FrameInfo>) -> &[StackEntry] {
        let entries = frames
            .into_iter()
            .map(|frame| StackEntry {
                id: self.frames.alloc(frame.id),
                frame,
            })
            .collect();
        self.stacks.entry(thread_id).or_insert(entries)
    }

    pub fn frame(&self, id: i64) -> Option<FrameId> {
        self.frames.get(id).copied()
    }

    /// Reference for the locals scope of a DAP frame; stable within one stop.
    pub fn locals_reference(&mut self, frame_id: i64) -> Option<i64> {
        let server_frame = self.frame(frame_id)?;
        if let Some(&reference) = self.locals.get(&frame_id) {
            return Some(reference);
        }
        let reference = self
            .containers
            .alloc(VariableContainer::Locals(server_frame));
        self.locals.insert(frame_id, reference);
        Some(reference)
    }

    pub fn container(&self, reference: i64) -> Option<VariableContainer> {
        self.containers.get(reference).copied()
    }

    pub fn children(&self, reference: i64) -> Option<&[DapVariable]> {
        self.children.get(&reference).map(Vec::as_slice)
    }

    pub fn store_children(&mut self, reference: i64, values: Vec<VariableInfo>) -> &[DapVariable] {
        let variables = values
            .into_iter()
            .map(|value| DapVariable {
                variables_reference: if value.children == 0 {
                    0
                } else {
                    self.containers
                        .alloc(VariableContainer::Children(value.children))
                },
                name: value.name,
                value: value.value,
                type_name: (!value.type_name.is_empty()).then_some(value.type_name),
            })
            .collect();
        self.children.entry(reference).or_insert(variables)
    }
}
