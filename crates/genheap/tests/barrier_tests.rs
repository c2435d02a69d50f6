//! Write barrier tests
//!
//! Stores of fresh references into old containers must leave the covering
//! cards dirty, no matter how many threads store concurrently.

use std::sync::Arc;

use genheap::layout::REFERENCE_SIZE;
use genheap::{
    CARD_SIZE, Collector, GenerationalSpace, Heap, HeapParameters, MemoryRequest, ObjectRef,
    TypeSpec,
};

fn heap_with_space(params: HeapParameters) -> (Arc<Heap>, Arc<GenerationalSpace>) {
    let space = Arc::new(GenerationalSpace::new(&params).unwrap());
    let heap = Heap::with_collector(params, space.clone()).unwrap();
    (heap, space)
}

#[test]
fn test_concurrent_stores_into_large_array() {
    for outline_barriers in [false, true] {
        let (heap, _space) = heap_with_space(HeapParameters {
            outline_barriers,
            ..HeapParameters::small()
        });
        let object = heap.register_type(TypeSpec::instance("Object", 16));
        let objects =
            heap.register_type(TypeSpec::reference_array("Object[]", Some(object.id())));

        let length = 64 * CARD_SIZE / REFERENCE_SIZE;
        let container = {
            let mut mutator = heap.attach_thread().unwrap();
            mutator.allocate_array(&objects, length as i32).unwrap()
        };
        assert!(heap.header(container).is_unaligned());
        heap.card_table().clear();

        let threads = 4;
        crossbeam_utils::thread::scope(|scope| {
            for t in 0..threads {
                let heap = &heap;
                let object = &object;
                let objects = &objects;
                scope.spawn(move |_| {
                    let mut mutator = heap.attach_thread().unwrap();
                    // Every 37th slot, interleaved across threads
                    for index in (t * 37..length).step_by(threads * 37) {
                        let value = mutator.allocate_instance(object).unwrap();
                        heap.write_reference(
                            container,
                            objects.layout().element_offset(index),
                            Some(value),
                        );
                    }
                });
            }
        })
        .unwrap();

        let mut expected = Vec::new();
        for t in 0..threads {
            for index in (t * 37..length).step_by(threads * 37) {
                let slot = container
                    .address()
                    .offset(objects.layout().element_offset(index));
                assert!(heap.card_table().is_dirty(slot), "slot {index} card clean");
                expected.push(heap.card_table().card_index(slot));
            }
        }
        // Precise marking: only cards holding written slots are dirty
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(heap.card_table().dirty_count(), expected.len());
    }
}

#[test]
fn test_concurrent_stores_into_old_objects() {
    let (heap, space) = heap_with_space(HeapParameters::small());
    let node = heap.register_type(TypeSpec::instance("Node", 32).with_reference_at(16));

    // Spend the young budget so every container lands in old memory
    while space.obtain_memory(MemoryRequest::Tlab).is_some() {}
    let containers: Vec<ObjectRef> = {
        let mut mutator = heap.attach_thread().unwrap();
        (0..256)
            .map(|_| mutator.allocate_instance(&node).unwrap())
            .collect()
    };
    heap.card_table().clear();
    assert!(containers.iter().all(|&c| heap.needs_barrier(c)));

    crossbeam_utils::thread::scope(|scope| {
        for chunk in containers.chunks(64) {
            let heap = &heap;
            scope.spawn(move |_| {
                for &container in chunk {
                    // Racing threads store into the same objects
                    heap.write_reference(container, 16, Some(container));
                    heap.write_reference(container, 16, Some(chunk[0]));
                }
            });
        }
        for &container in containers.iter().rev() {
            heap.write_reference(container, 16, None);
        }
    })
    .unwrap();

    for &container in &containers {
        assert!(heap.card_table().is_dirty(container.address()));
    }
}

#[test]
fn test_young_stores_skip_the_card_table() {
    let (heap, _space) = heap_with_space(HeapParameters::small());
    let node = heap.register_type(TypeSpec::instance("Node", 32).with_reference_at(16));
    let mut mutator = heap.attach_thread().unwrap();
    let a = mutator.allocate_instance(&node).unwrap();
    let b = mutator.allocate_instance(&node).unwrap();
    heap.card_table().clear();

    for _ in 0..100 {
        heap.write_reference(a, 16, Some(b));
        heap.write_reference(b, 16, Some(a));
    }
    assert!(!heap.needs_barrier(a));
    assert_eq!(heap.card_table().dirty_count(), 0);
}

#[test]
fn test_range_barrier_on_large_array() {
    let (heap, _space) = heap_with_space(HeapParameters::small());
    let objects = heap.register_type(TypeSpec::reference_array("Object[]", None));
    let mut mutator = heap.attach_thread().unwrap();
    let length = 16 * CARD_SIZE / REFERENCE_SIZE;
    let array = mutator.allocate_array(&objects, length as i32).unwrap();
    heap.card_table().clear();

    let layout = objects.layout();
    let start = array.address().offset(layout.element_offset(100));
    let end = array.address().offset(layout.element_offset(300));
    heap.write_barrier_range(array, start, end);

    let expected: Vec<_> = (0..heap.card_table().card_count())
        .filter(|&i| {
            let (card_start, card_end) = heap.card_table().card_bounds(i);
            card_end > start && card_start < end
        })
        .collect();
    let dirty: Vec<_> = (0..heap.card_table().card_count())
        .filter(|&i| heap.card_table().is_dirty(heap.card_table().card_bounds(i).0))
        .collect();
    assert_eq!(dirty, expected);

    // Empty range is a no-op
    heap.card_table().clear();
    heap.write_barrier_range(array, start, start);
    assert_eq!(heap.card_table().dirty_count(), 0);
}

#[test]
fn test_collect_keeps_cards() {
    let (heap, space) = heap_with_space(HeapParameters::small());
    let objects = heap.register_type(TypeSpec::reference_array("Object[]", None));
    let mut mutator = heap.attach_thread().unwrap();
    let length = 4 * CARD_SIZE / REFERENCE_SIZE;
    let array = mutator.allocate_array(&objects, length as i32).unwrap();
    let dirty = heap.card_table().dirty_count();
    assert!(dirty > 0);

    heap.collect();
    assert_eq!(space.collection_epoch(), 1);
    assert_eq!(space.stats().bytes_allocated_since_collection, 0);
    assert_eq!(heap.card_table().dirty_count(), dirty);
    assert!(heap.card_table().is_dirty(array.address()));
}
