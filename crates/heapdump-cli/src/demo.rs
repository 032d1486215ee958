//! A small object graph shaped like a service's heap: a global object, a
//! registry of records, interned strings, and a weak cache.

use heapdump::{HeapError, ManagedHeap, NodeKind, ObjectId};

/// Handles to the long-lived parts of the demo graph.
#[derive(Debug, Clone, Copy)]
pub struct DemoHeap {
    pub global: ObjectId,
    pub registry: ObjectId,
    pub cache: ObjectId,
}

pub fn populate(heap: &ManagedHeap, records: usize) -> Result<DemoHeap, HeapError> {
    heap.mutate(|m| {
        let global = m.alloc(NodeKind::Object, "Global", 128)?;
        let registry = m.alloc(NodeKind::Array, "Array", 64)?;
        let cache = m.alloc(NodeKind::Object, "WeakCache", 48)?;
        let handler = m.alloc(NodeKind::Closure, "onRequest", 72)?;
        let source = m.alloc(NodeKind::Code, "(compiled code)", 512)?;
        m.add_root(global)?;
        m.set_property(global, "registry", registry)?;
        m.set_property(global, "cache", cache)?;
        m.set_property(global, "onRequest", handler)?;
        m.set_internal(handler, "code", source)?;
        m.set_internal(handler, "context", global)?;

        let mut previous: Option<ObjectId> = None;
        for i in 0..records {
            let record = m.alloc(NodeKind::Object, "Record", 40)?;
            let label = m.alloc(NodeKind::String, format!("record-{i}"), 24)?;
            let score = m.alloc(NodeKind::Number, "heap number", 16)?;
            m.push_element(registry, record)?;
            m.set_property(record, "label", label)?;
            m.set_property(record, "score", score)?;
            m.set_internal(record, "map", global)?;
            if let Some(previous) = previous {
                m.set_weak(record, "previous", previous)?;
            }
            if i % 8 == 0 {
                m.set_weak(cache, &format!("entry{i}"), record)?;
            }
            previous = Some(record);
        }

        Ok(DemoHeap {
            global,
            registry,
            cache,
        })
    })
}

/// One unit of mutator work: swaps the global's in-flight request for a new
/// one and collects every few ticks.
pub fn churn(heap: &ManagedHeap, demo: DemoHeap, tick: u64) -> Result<usize, HeapError> {
    heap.mutate(|m| {
        let request = m.alloc(NodeKind::Object, "Request", 96)?;
        let body = m.alloc(NodeKind::String, format!("request body #{tick}"), 64)?;
        m.set_property(request, "body", body)?;
        m.set_property(demo.global, "current", request)?;
        m.set_weak(demo.cache, "last", request)?;
        Ok(if tick % 16 == 0 { m.collect() } else { 0 })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_heap_reaches_every_record() {
        let heap = ManagedHeap::new();
        let demo = populate(&heap, 10).expect("populate");
        // global, registry, cache, handler, code + three objects per record
        assert_eq!(heap.reachable().len(), 5 + 30);
        assert!(heap.reachable().contains(&demo.registry));
    }

    #[test]
    fn churn_keeps_only_the_latest_request() {
        let heap = ManagedHeap::new();
        let demo = populate(&heap, 2).expect("populate");
        let baseline = heap.reachable().len();
        for tick in 1..=16 {
            churn(&heap, demo, tick).expect("churn");
        }
        assert_eq!(heap.reachable().len(), baseline + 2);
        assert_eq!(heap.len(), baseline + 2);
    }
}
