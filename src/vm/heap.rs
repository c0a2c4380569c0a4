//! Bump allocator and stop-the-world mark-and-compact collector.
//!
//! Every heap object is `[mark u8][forward u32][size u32][payload]`. The
//! collector runs only from inside [`allocate`] (or an explicit request) and
//! finishes before any instruction executes again.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::VmError;
use crate::program::model::{Model, TypeCode, TypeSpecifier, TypeView};

use super::memory::{
    Address, FORWARD_OFFSET, MARK_OFFSET, OBJECT_HEADER_SIZE, SIZE_OFFSET, SLICE_HEADER_SIZE,
    SLICE_LENGTH_OFFSET,
};
use super::Machine;

// =============================================================================
// Allocation
// =============================================================================

/// Allocate an object with a `size`-byte zeroed payload and return the
/// address of its header.
pub fn allocate(
    model: &Model,
    config: &RuntimeConfig,
    machine: &mut Machine,
    size: u32,
) -> Result<Address, VmError> {
    let total = OBJECT_HEADER_SIZE as u64 + size as u64;
    if machine.heap_pointer as u64 + total > machine.heap_size as u64 {
        collect(model, machine)?;
        resize_heap(config, machine, total)?;
    }

    let object = machine.heap_top();
    let memory = &mut machine.memory;
    memory.write_u8(object.add(MARK_OFFSET)?, 0)?;
    memory.write_u32(object.add(FORWARD_OFFSET)?, 0)?;
    memory.write_u32(object.add(SIZE_OFFSET)?, size)?;
    memory.zero(object.add(OBJECT_HEADER_SIZE)?, size)?;
    machine.heap_pointer += total as u32;
    Ok(object)
}

/// Payload size recorded in an object's header.
pub fn payload_size(machine: &Machine, object: Address) -> Result<u32, VmError> {
    machine.memory.read_u32(object.add(SIZE_OFFSET)?)
}

/// Grow or shrink the heap after a collection so that the free fraction,
/// counting the pending request as used, lands between the configured
/// low- and high-water marks.
fn resize_heap(config: &RuntimeConfig, machine: &mut Machine, request: u64) -> Result<(), VmError> {
    let used = machine.heap_pointer as u64 + request;
    let current = machine.heap_size as u64;
    let limit = config.max_heap_size as u64;
    if used > limit {
        return Err(VmError::HeapExhausted {
            requested: request,
            limit: config.max_heap_size,
        });
    }

    let free_ratio = if current == 0 {
        0.0
    } else {
        current.saturating_sub(used) as f64 / current as f64
    };
    let min_free = config.min_heap_free_ratio as f64;
    let max_free = config.max_heap_free_ratio as f64;
    let target = if free_ratio < min_free {
        (used as f64 / (1.0 - min_free)).ceil() as u64
    } else if free_ratio > max_free {
        ((used as f64 / (1.0 - max_free)).ceil() as u64).max(config.initial_heap_size as u64)
    } else {
        current
    };
    let target = target.max(used).min(limit);

    if target != current {
        info!(from = current, to = target, used, "resizing heap");
        machine.set_heap_size(target as u32);
    }
    Ok(())
}

// =============================================================================
// Collection
// =============================================================================

/// A reference slot's target, with the type of what it points at.
#[derive(Clone, Copy)]
enum Reference<'m> {
    Pointer(TypeView<'m>),
    Slice(TypeView<'m>),
    Str,
}

struct Marker<'m> {
    model: &'m Model,
    /// Object start → header+payload size.
    objects: BTreeMap<u32, u32>,
    live: BTreeSet<u32>,
    /// Reference slots already followed.
    visited: HashSet<u32>,
    /// `(slot, value it held)` for every followed reference.
    patches: Vec<(Address, u32)>,
    worklist: Vec<(Address, TypeView<'m>)>,
}

impl<'m> Marker<'m> {
    fn new(model: &'m Model, objects: BTreeMap<u32, u32>) -> Self {
        Self {
            model,
            objects,
            live: BTreeSet::new(),
            visited: HashSet::new(),
            patches: Vec::new(),
            worklist: Vec::new(),
        }
    }

    /// The object whose bytes contain `addr`, for interior references.
    fn containing(&self, addr: u32) -> Option<u32> {
        self.objects
            .range(..=addr)
            .next_back()
            .filter(|(start, total)| addr < **start + **total)
            .map(|(start, _)| *start)
    }

    fn root(&mut self, machine: &Machine, slot: Address, view: TypeView<'m>) -> Result<(), VmError> {
        if self.model.holds_references(&view) {
            self.worklist.push((slot, view));
        }
        self.drain(machine)
    }

    fn drain(&mut self, machine: &Machine) -> Result<(), VmError> {
        let model = self.model;
        while let Some((addr, view)) = self.worklist.pop() {
            match view.outer() {
                Some(TypeSpecifier::Pointer) => {
                    self.follow(machine, addr, Reference::Pointer(view.rest()))?
                }
                Some(TypeSpecifier::Slice) => {
                    self.follow(machine, addr, Reference::Slice(view.rest()))?
                }
                Some(TypeSpecifier::Array) => {
                    let element = view.rest();
                    if !model.holds_references(&element) {
                        continue;
                    }
                    let count = view.lengths.first().copied().unwrap_or(0);
                    let stride = element.size();
                    for i in 0..count {
                        self.worklist.push((addr.add(i * stride)?, element));
                    }
                }
                None => match view.record_type {
                    Some(id) => {
                        for field in &model.record_type(id).fields {
                            let field_view = field.declared_type();
                            if model.holds_references(&field_view) {
                                self.worklist.push((addr.add(field.offset)?, field_view));
                            }
                        }
                    }
                    None if view.type_code == TypeCode::Str => {
                        self.follow(machine, addr, Reference::Str)?
                    }
                    None => {}
                },
            }
        }
        Ok(())
    }

    fn follow(&mut self, machine: &Machine, slot: Address, target: Reference<'m>) -> Result<(), VmError> {
        if !self.visited.insert(slot.get()) {
            return Ok(());
        }
        let value = machine.memory.read_address(slot)?;
        if !machine.in_heap(value) {
            // nil, or a reference to stack or data-segment storage
            return Ok(());
        }
        let Some(object) = self.containing(value.get()) else {
            warn!(slot = %slot, value = %value, "reference into no object");
            return Ok(());
        };
        self.patches.push((slot, value.get()));
        self.live.insert(object);

        match target {
            Reference::Pointer(pointee) => {
                if self.model.holds_references(&pointee) {
                    self.worklist.push((value.add(OBJECT_HEADER_SIZE)?, pointee));
                }
            }
            Reference::Slice(element) => {
                if self.model.holds_references(&element) {
                    let length = machine.memory.read_u32(value.add(SLICE_LENGTH_OFFSET)?)?;
                    let base = value.add(OBJECT_HEADER_SIZE + SLICE_HEADER_SIZE)?;
                    let stride = element.size();
                    for i in 0..length {
                        self.worklist.push((base.add(i * stride)?, element));
                    }
                }
            }
            Reference::Str => {}
        }
        Ok(())
    }
}

/// Start and total size of every object currently in the heap.
fn object_table(machine: &Machine) -> Result<BTreeMap<u32, u32>, VmError> {
    let mut objects = BTreeMap::new();
    let mut cursor = machine.heap_base();
    let top = machine.heap_top();
    while cursor < top {
        let total = OBJECT_HEADER_SIZE + payload_size(machine, cursor)?;
        objects.insert(cursor.get(), total);
        cursor = cursor.add(total)?;
    }
    if cursor != top {
        return Err(VmError::InvalidAddress {
            address: cursor.get() as u64,
            len: OBJECT_HEADER_SIZE as u64,
        });
    }
    Ok(objects)
}

/// Run one full collection cycle.
///
/// Roots are the reference-holding globals of every package and the
/// declared pointer slots of every active frame. Live objects slide down to
/// the heap base in address order; every traced reference is rewritten to
/// its object's new location before any byte moves.
pub fn collect(model: &Model, machine: &mut Machine) -> Result<(), VmError> {
    let started = Instant::now();
    let before = machine.heap_pointer;

    let mut marker = Marker::new(model, object_table(machine)?);
    for (_, package) in model.packages.iter() {
        for global in &package.globals {
            marker.root(machine, Address::new(global.offset), global.declared_type())?;
        }
    }
    for call in &machine.calls {
        let function = model.function(call.operator);
        for root in &function.list_of_pointers {
            let slot = Address::new(call.frame_pointer).add(root.offset)?;
            marker.root(machine, slot, root.declared_type())?;
        }
    }

    // Forwarding addresses, contiguous from the heap base in address order.
    let mut forwarding = BTreeMap::new();
    let mut next = machine.heap_starts_at;
    for start in &marker.live {
        let total = marker.objects[start];
        forwarding.insert(*start, next);
        let header = Address::new(*start);
        machine.memory.write_u8(header.add(MARK_OFFSET)?, 1)?;
        machine.memory.write_u32(header.add(FORWARD_OFFSET)?, next)?;
        next += total;
    }
    let live_bytes = next - machine.heap_starts_at;

    for (slot, old) in &marker.patches {
        if let Some(object) = marker.containing(*old) {
            let moved = forwarding[&object] + (*old - object);
            machine.memory.write_u32(*slot, moved)?;
        }
    }

    // Destinations never exceed sources, so an ascending slide is safe.
    for (old, new) in &forwarding {
        let total = marker.objects[old];
        let (old, new) = (Address::new(*old), Address::new(*new));
        machine.memory.copy_within(old, new, total)?;
        machine.memory.write_u8(new.add(MARK_OFFSET)?, 0)?;
        machine.memory.write_u32(new.add(FORWARD_OFFSET)?, 0)?;
    }

    machine.heap_pointer = live_bytes;
    let freed = before - live_bytes;
    machine.memory.zero(machine.heap_top(), freed)?;

    let pause = started.elapsed();
    let stats = &mut machine.gc_stats;
    stats.cycles += 1;
    stats.bytes_reclaimed += freed as u64;
    stats.total_pause += pause;
    stats.max_pause = stats.max_pause.max(pause);
    debug!(
        cycle = stats.cycles,
        objects = forwarding.len(),
        live_bytes,
        reclaimed = freed,
        ?pause,
        "collection finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::model::{Argument, Function, Package, RecordType};
    use crate::vm::Call;
    use crate::vm::memory::POINTER_SIZE;

    const STACK: u32 = 64;

    fn pointer_to(name: &str, offset: u32, base: TypeCode) -> Argument {
        let mut arg = Argument::new(name, base, base.size());
        arg.specifiers = vec![TypeSpecifier::Pointer];
        arg.offset = offset;
        arg.total_size = POINTER_SIZE;
        arg
    }

    /// A model with one function whose frame has two pointer roots at 0 and 4.
    fn model_with_roots(roots: Vec<Argument>) -> Model {
        let mut model = Model::new();
        let main = model.add_package(Package::new("main"));
        model.add_function(Function {
            name: "main".to_string(),
            package: main,
            inputs: vec![],
            outputs: vec![],
            expressions: vec![],
            size: 16,
            list_of_pointers: roots,
        });
        model
    }

    fn machine_with_frame(model: &Model, heap: u32) -> Machine {
        let mut machine = Machine::new(STACK, 0, heap);
        let (id, _) = model.functions.iter().next().unwrap();
        machine.calls.push(Call {
            operator: id,
            line: 0,
            frame_pointer: 4,
        });
        machine.stack_pointer = 20;
        machine
    }

    fn config(initial: u32, max: u32) -> RuntimeConfig {
        RuntimeConfig {
            stack_size: STACK,
            initial_heap_size: initial,
            max_heap_size: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_bump_allocation_writes_header() {
        let model = Model::new();
        let mut machine = Machine::new(STACK, 0, 64);
        let config = config(64, 1024);
        let a = allocate(&model, &config, &mut machine, 4).unwrap();
        let b = allocate(&model, &config, &mut machine, 8).unwrap();
        assert_eq!(a, machine.heap_base());
        assert_eq!(b, a.add(13).unwrap());
        assert_eq!(payload_size(&machine, b).unwrap(), 8);
        assert_eq!(machine.heap_pointer, 13 + 17);
    }

    #[test]
    fn test_collect_keeps_rooted_objects_and_compacts() {
        let model = model_with_roots(vec![pointer_to("p", 0, TypeCode::I32)]);
        let mut machine = machine_with_frame(&model, 256);
        let config = config(256, 1024);

        let garbage = allocate(&model, &config, &mut machine, 16).unwrap();
        let kept = allocate(&model, &config, &mut machine, 4).unwrap();
        machine.memory.write_i32(kept.add(9).unwrap(), 42).unwrap();
        machine.memory.write_address(Address::new(4), kept).unwrap();

        collect(&model, &mut machine).unwrap();

        assert_eq!(machine.heap_pointer, 13);
        let moved = machine.memory.read_address(Address::new(4)).unwrap();
        assert_eq!(moved, garbage);
        assert_eq!(machine.memory.read_i32(moved.add(9).unwrap()).unwrap(), 42);
        assert_eq!(machine.memory.read_u8(moved).unwrap(), 0);
        assert_eq!(machine.gc_stats.cycles, 1);
        assert_eq!(machine.gc_stats.bytes_reclaimed, 25);
        // the reclaimed tail is zeroed
        let tail = machine.memory.read_bytes(machine.heap_top(), 25).unwrap();
        assert!(tail.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_collect_with_everything_reachable_preserves_bytes() {
        let model = model_with_roots(vec![
            pointer_to("p", 0, TypeCode::I32),
            pointer_to("q", 4, TypeCode::I32),
        ]);
        let mut machine = machine_with_frame(&model, 256);
        let config = config(256, 1024);
        let a = allocate(&model, &config, &mut machine, 4).unwrap();
        let b = allocate(&model, &config, &mut machine, 4).unwrap();
        machine.memory.write_address(Address::new(4), a).unwrap();
        machine.memory.write_address(Address::new(8), b).unwrap();
        machine.memory.write_i32(a.add(9).unwrap(), 7).unwrap();
        machine.memory.write_i32(b.add(9).unwrap(), 8).unwrap();
        let snapshot = machine.memory.as_bytes().to_vec();

        collect(&model, &mut machine).unwrap();

        assert_eq!(machine.heap_pointer, 26);
        assert_eq!(machine.memory.as_bytes(), snapshot.as_slice());
    }

    #[test]
    fn test_collect_traces_through_record_fields() {
        // Node { value i32, next *Node }
        let mut model = model_with_roots(vec![]);
        let main = model.find_package("main").unwrap();
        let mut next = Argument::new("next", TypeCode::Record, 0);
        next.specifiers = vec![TypeSpecifier::Pointer];
        next.offset = 4;
        next.total_size = POINTER_SIZE;
        let node = model.add_record_type(RecordType {
            name: "Node".to_string(),
            package: main,
            fields: vec![Argument::new("value", TypeCode::I32, 4), next],
            size: 8,
        });
        model.record_types[node].fields[1].record_type = Some(node);
        model.record_types[node].fields[1].size = 8;
        let mut head = pointer_to("head", 0, TypeCode::Record);
        head.record_type = Some(node);
        head.size = 8;
        let (fid, _) = model.functions.iter().next().unwrap();
        model.functions[fid].list_of_pointers = vec![head];

        let mut machine = machine_with_frame(&model, 512);
        let config = config(512, 1024);
        let junk = allocate(&model, &config, &mut machine, 30).unwrap();
        let second = allocate(&model, &config, &mut machine, 8).unwrap();
        let first = allocate(&model, &config, &mut machine, 8).unwrap();
        machine.memory.write_i32(second.add(9).unwrap(), 2).unwrap();
        machine.memory.write_i32(first.add(9).unwrap(), 1).unwrap();
        machine.memory.write_address(first.add(13).unwrap(), second).unwrap();
        // a cycle back to the head
        machine.memory.write_address(second.add(13).unwrap(), first).unwrap();
        machine.memory.write_address(Address::new(4), first).unwrap();

        collect(&model, &mut machine).unwrap();

        assert_eq!(machine.heap_pointer, 34);
        let head = machine.memory.read_address(Address::new(4)).unwrap();
        let tail = machine.memory.read_address(head.add(13).unwrap()).unwrap();
        assert_eq!(tail, junk);
        assert_eq!(head, junk.add(17).unwrap());
        assert_eq!(machine.memory.read_i32(head.add(9).unwrap()).unwrap(), 1);
        assert_eq!(machine.memory.read_i32(tail.add(9).unwrap()).unwrap(), 2);
        assert_eq!(machine.memory.read_address(tail.add(13).unwrap()).unwrap(), head);
    }

    #[test]
    fn test_interior_pointer_keeps_object_and_offset() {
        let model = model_with_roots(vec![pointer_to("p", 0, TypeCode::I32)]);
        let mut machine = machine_with_frame(&model, 256);
        let config = config(256, 1024);
        allocate(&model, &config, &mut machine, 8).unwrap();
        let object = allocate(&model, &config, &mut machine, 12).unwrap();
        machine.memory.write_i32(object.add(9 + 8).unwrap(), 99).unwrap();
        // points at the third i32, stored header-adjusted
        let interior = object.add(8).unwrap();
        machine.memory.write_address(Address::new(4), interior).unwrap();

        collect(&model, &mut machine).unwrap();

        assert_eq!(machine.heap_pointer, 21);
        let moved = machine.memory.read_address(Address::new(4)).unwrap();
        assert_eq!(moved, machine.heap_base().add(8).unwrap());
        assert_eq!(machine.memory.read_i32(moved.add(9).unwrap()).unwrap(), 99);
    }

    #[test]
    fn test_allocation_grows_heap_after_collection() {
        let model = model_with_roots(vec![pointer_to("p", 0, TypeCode::I32)]);
        let mut machine = machine_with_frame(&model, 32);
        let config = config(32, 4096);
        let kept = allocate(&model, &config, &mut machine, 16).unwrap();
        machine.memory.write_address(Address::new(4), kept).unwrap();
        allocate(&model, &config, &mut machine, 16).unwrap();
        assert_eq!(machine.gc_stats.cycles, 1);
        assert!(machine.heap_size >= 50);
        assert_eq!(machine.memory.len() as u32, machine.heap_starts_at + machine.heap_size);
        assert_eq!(machine.heap_pointer, 50);
    }

    #[test]
    fn test_heap_exhausted_past_limit() {
        let model = model_with_roots(vec![]);
        let mut machine = machine_with_frame(&model, 32);
        let config = config(32, 64);
        assert!(matches!(
            allocate(&model, &config, &mut machine, 100),
            Err(VmError::HeapExhausted { requested: 109, limit: 64 })
        ));
    }

    #[test]
    fn test_heap_shrinks_when_mostly_free() {
        let model = model_with_roots(vec![]);
        let mut machine = machine_with_frame(&model, 16);
        let config = config(16, 1 << 20);
        // grows to fit a large object that then becomes garbage
        allocate(&model, &config, &mut machine, 4000).unwrap();
        let grown = machine.heap_size;
        assert!(grown >= 4009);
        allocate(&model, &config, &mut machine, 2000).unwrap();
        assert_eq!(machine.gc_stats.cycles, 1);
        // nothing is rooted, so this collection frees everything
        allocate(&model, &config, &mut machine, 1000).unwrap();
        assert_eq!(machine.gc_stats.cycles, 2);
        assert_eq!(machine.heap_pointer, 1009);
        assert!(machine.heap_size < grown);
        assert!(machine.heap_size >= 3 * 1009);
    }
}
