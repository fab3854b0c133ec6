//! The VMA map and the W^X / SMC state machine.
//!
//! Lock order: the VMA map lock is never held while the code-invalidation
//! callback runs writer-side work of its own; the fault path takes the map
//! lock shared so it cannot block behind mutators. The RWX interval lock is
//! a leaf and is never held across either of the others.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::elf::{self, Phdr, PF_R, PF_W, PF_X};
use crate::host::HostMem;
use crate::interval::IntervalSet;
use crate::prot::{MapFlags, Prot};
use crate::resource::{ExecutableFileInfo, MappedResource, Mrid, SpecialDev};
use crate::{page_align_down, page_align_up, PAGE_SIZE};

/// Downstream hook invalidating translated code whose source bytes
/// intersect a range.
pub trait CodeInvalidator {
    fn invalidate_code_range(&self, start: u64, len: u64);
}

/// Queries about the currently executing translated block, answered by the
/// JIT side. Used to decide the single-step re-entry case.
pub trait CurrentBlockQuery {
    /// Whether the faulting host PC lies inside the translated-code buffer.
    fn host_pc_in_code_buffer(&self, host_pc: u64) -> bool;
    /// Whether the current block was already compiled as a single
    /// instruction.
    fn current_block_is_single_inst(&self) -> bool;
    /// Whether the current block's guest source range intersects
    /// `[start, start+len)`.
    fn current_block_intersects(&self, start: u64, len: u64) -> bool;
}

/// Result of routing a host write fault through the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegfaultOutcome {
    /// Not ours; deliver onward.
    NotHandled,
    /// Consumed: the page was reopened for writing, the stale code
    /// invalidated, and the guest should retry the store.
    Handled {
        /// The faulting store patched the block being executed; re-enter
        /// the dispatcher in single-instruction mode so further SMC is
        /// observed instantly.
        single_step: bool,
    },
}

/// One tracked mapping. Keyed by base address in the map; never overlaps
/// its neighbours.
#[derive(Debug, Clone)]
pub struct VmaEntry {
    pub len: u64,
    pub prot: Prot,
    pub flags: MapFlags,
    pub resource: Option<Arc<MappedResource>>,
    /// Offset of this VMA within its resource.
    pub offset: u64,
}

/// How a new mapping is backed.
pub enum Backing<'a> {
    Anonymous {
        shared: bool,
    },
    File {
        dev: u64,
        inode: u64,
        /// Identity for executable regular files (enables AOT attribution).
        file_info: Option<ExecutableFileInfo>,
        /// Bytes of the file header when mapping file offset zero, used to
        /// capture ELF program headers.
        header_bytes: Option<&'a [u8]>,
    },
}

#[derive(Default)]
struct VmaState {
    vmas: BTreeMap<u64, VmaEntry>,
    resources: BTreeMap<Mrid, Vec<Arc<MappedResource>>>,
}

impl VmaState {
    /// The entry containing `addr`, if any.
    fn find(&self, addr: u64) -> Option<(u64, &VmaEntry)> {
        let (&base, entry) = self.vmas.range(..=addr).next_back()?;
        if addr < base + entry.len {
            Some((base, entry))
        } else {
            None
        }
    }

    /// Remove every byte of `[addr, addr+len)` from the map, splitting
    /// entries that straddle the edges.
    fn delete_range(&mut self, addr: u64, len: u64) {
        let end = addr + len;

        // Entry straddling the start.
        if let Some((base, entry)) = self.find(addr).map(|(b, e)| (b, e.clone())) {
            if base < addr {
                let head_len = addr - base;
                let tail_len = (base + entry.len).saturating_sub(end);
                self.vmas.get_mut(&base).unwrap().len = head_len;
                if tail_len > 0 {
                    self.vmas.insert(
                        end,
                        VmaEntry {
                            len: tail_len,
                            offset: entry.offset + (end - base),
                            ..entry
                        },
                    );
                    return;
                }
            }
        }

        // Whole entries inside the range, and one possibly hanging past the
        // end.
        let contained: Vec<u64> = self
            .vmas
            .range(addr..end)
            .map(|(&base, _)| base)
            .collect();
        for base in contained {
            let entry = self.vmas.remove(&base).unwrap();
            let entry_end = base + entry.len;
            if entry_end > end {
                self.vmas.insert(
                    end,
                    VmaEntry {
                        len: entry_end - end,
                        offset: entry.offset + (end - base),
                        ..entry
                    },
                );
            }
        }
    }

    /// Insert a new range, replacing whatever it overlaps, then coalesce
    /// with identical neighbours.
    fn track_range(&mut self, addr: u64, entry: VmaEntry) {
        self.delete_range(addr, entry.len);
        self.vmas.insert(addr, entry);
        self.coalesce_around(addr);
    }

    fn coalesce_around(&mut self, addr: u64) {
        // Merge with the previous entry when attributes line up.
        if let Some((&prev_base, prev)) = self.vmas.range(..addr).next_back() {
            let cur = &self.vmas[&addr];
            let mergeable = prev_base + prev.len == addr
                && prev.prot == cur.prot
                && prev.flags == cur.flags
                && match (&prev.resource, &cur.resource) {
                    (None, None) => true,
                    (Some(a), Some(b)) => {
                        Arc::ptr_eq(a, b) && prev.offset + prev.len == cur.offset
                    }
                    _ => false,
                };
            if mergeable {
                let cur_len = cur.len;
                let cur = self.vmas.remove(&addr).unwrap();
                drop(cur);
                self.vmas.get_mut(&prev_base).unwrap().len += cur_len;
                self.coalesce_around(prev_base);
                return;
            }
        }
        // Merge with the following entry.
        let cur = self.vmas[&addr].clone();
        let next_base = addr + cur.len;
        if let Some(next) = self.vmas.get(&next_base) {
            let mergeable = next.prot == cur.prot
                && next.flags == cur.flags
                && match (&cur.resource, &next.resource) {
                    (None, None) => true,
                    (Some(a), Some(b)) => {
                        Arc::ptr_eq(a, b) && cur.offset + cur.len == next.offset
                    }
                    _ => false,
                };
            if mergeable {
                let next = self.vmas.remove(&next_base).unwrap();
                self.vmas.get_mut(&addr).unwrap().len += next.len;
                drop(next);
            }
        }
    }

    /// All VMAs backed by `resource` (mirrors through every alias).
    fn mirrors_of(&self, resource: &Arc<MappedResource>) -> Vec<(u64, VmaEntry)> {
        self.vmas
            .iter()
            .filter(|(_, e)| {
                e.resource
                    .as_ref()
                    .is_some_and(|r| Arc::ptr_eq(r, resource))
            })
            .map(|(&b, e)| (b, e.clone()))
            .collect()
    }
}

/// The tracker. One per guest address space.
#[derive(Default)]
pub struct VmaTracker {
    state: RwLock<VmaState>,
    /// Ranges the guest mapped writable+executable. Leaf lock.
    rwx: Mutex<IntervalSet>,
    anon_shared_counter: AtomicU64,
}

impl VmaTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh mapping. `addr`/`len` are what the host `mmap`
    /// actually returned.
    pub fn track_mmap(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        backing: Backing<'_>,
        offset: u64,
    ) {
        let len = page_align_up(len);
        {
            let mut state = self.state.write().unwrap();
            let resource = self.resource_for(&mut state, addr, len, prot, backing, offset);
            state.track_range(
                addr,
                VmaEntry {
                    len,
                    prot,
                    flags,
                    resource,
                    offset,
                },
            );
        }

        if prot.is_rwx() {
            self.rwx.lock().unwrap().insert(addr, addr + len);
        } else {
            self.rwx.lock().unwrap().remove(addr, addr + len);
        }
    }

    fn resource_for(
        &self,
        state: &mut VmaState,
        addr: u64,
        len: u64,
        prot: Prot,
        backing: Backing<'_>,
        offset: u64,
    ) -> Option<Arc<MappedResource>> {
        match backing {
            Backing::Anonymous { shared: false } => None,
            Backing::Anonymous { shared: true } => {
                let counter = self.anon_shared_counter.fetch_add(1, Ordering::Relaxed);
                let resource = MappedResource::anonymous_shared(counter);
                state
                    .resources
                    .entry(resource.mrid)
                    .or_default()
                    .push(Arc::clone(&resource));
                Some(resource)
            }
            Backing::File {
                dev,
                inode,
                file_info,
                header_bytes,
            } => {
                let mrid = Mrid {
                    dev: SpecialDev::Dev(dev),
                    id: inode,
                };
                let instances: Vec<Arc<MappedResource>> =
                    state.resources.get(&mrid).cloned().unwrap_or_default();

                let phdrs: Vec<Phdr> = header_bytes
                    .filter(|_| offset == 0)
                    .map(elf::parse_program_headers)
                    .unwrap_or_default();

                // Re-mapping the header of a known ELF starts a second
                // instance of the image (same file, different base).
                let mapping_header_again =
                    !instances.is_empty() && offset == 0 && !phdrs.is_empty();

                if instances.is_empty() || mapping_header_again {
                    let resource = Arc::new(MappedResource {
                        mrid,
                        file: file_info,
                        phdrs,
                        shm_length: None,
                    });
                    state
                        .resources
                        .entry(mrid)
                        .or_default()
                        .push(Arc::clone(&resource));
                    return Some(resource);
                }

                // Non-header mapping: attribute to the instance whose
                // program headers predict a matching base address.
                let access = (u32::from(prot.executable()) * PF_X)
                    | (u32::from(prot.writable()) * PF_W)
                    | (u32::from(prot.readable()) * PF_R);
                let chosen = instances.iter().find(|instance| {
                    if instance.phdrs.is_empty() {
                        return false;
                    }
                    let candidates =
                        elf::infer_mapping_base(&instance.phdrs, addr, len, offset, access);
                    instance_base(state, instance)
                        .is_some_and(|base| candidates.contains(&base))
                });
                match chosen {
                    Some(instance) => Some(Arc::clone(instance)),
                    None => {
                        if instances.iter().any(|i| !i.phdrs.is_empty()) {
                            // Some programs map sections of themselves that
                            // the program headers never mention.
                            info!(
                                addr,
                                offset, "could not attribute file mapping to an ELF base"
                            );
                        }
                        instances.first().map(Arc::clone)
                    }
                }
            }
        }
    }

    pub fn track_munmap(&self, addr: u64, len: u64) {
        let len = page_align_up(len);
        self.state.write().unwrap().delete_range(addr, len);
        self.rwx.lock().unwrap().remove(addr, addr + len);
    }

    pub fn track_mprotect(&self, addr: u64, len: u64, new_prot: Prot) {
        let len = page_align_up(len);
        {
            let mut state = self.state.write().unwrap();
            // Carve the range out and re-insert it with the new protection,
            // preserving backing attribution.
            let pieces: Vec<(u64, VmaEntry)> = state
                .vmas
                .range(..addr + len)
                .filter(|(&base, entry)| base + entry.len > addr)
                .map(|(&base, entry)| (base, entry.clone()))
                .collect();
            for (base, entry) in pieces {
                let start = base.max(addr);
                let end = (base + entry.len).min(addr + len);
                let piece = VmaEntry {
                    len: end - start,
                    prot: new_prot,
                    flags: entry.flags,
                    resource: entry.resource.clone(),
                    offset: entry.offset + (start - base),
                };
                state.track_range(start, piece);
            }
        }
        if new_prot.is_rwx() {
            self.rwx.lock().unwrap().insert(addr, addr + len);
        } else {
            self.rwx.lock().unwrap().remove(addr, addr + len);
        }
    }

    /// mremap bookkeeping. `old_len == 0` mirrors a shared mapping;
    /// `dont_unmap` leaves the source range tracked (as the kernel does).
    pub fn track_mremap(
        &self,
        old_addr: u64,
        old_len: u64,
        new_addr: u64,
        new_len: u64,
        dont_unmap: bool,
    ) {
        let old_len = page_align_up(old_len);
        let new_len = page_align_up(new_len);

        let mut state = self.state.write().unwrap();
        let Some((base, entry)) = state.find(old_addr).map(|(b, e)| (b, e.clone())) else {
            warn!(old_addr, "mremap of an untracked range");
            return;
        };
        let offset = entry.offset + (old_addr - base);

        if old_len == 0 {
            // Mirror: only valid for shared mappings.
            debug_assert!(entry.flags.shared());
            state.track_range(
                new_addr,
                VmaEntry {
                    len: new_len,
                    prot: entry.prot,
                    flags: entry.flags,
                    resource: entry.resource.clone(),
                    offset,
                },
            );
            return;
        }

        if !dont_unmap {
            state.delete_range(old_addr, old_len);
        }
        state.track_range(
            new_addr,
            VmaEntry {
                len: new_len,
                prot: entry.prot,
                flags: entry.flags,
                resource: entry.resource,
                offset,
            },
        );
    }

    pub fn track_shmat(&self, shmid: u64, addr: u64, len: u64, prot: Prot) {
        let len = page_align_up(len);
        let mut state = self.state.write().unwrap();
        let mrid = Mrid {
            dev: SpecialDev::Shm,
            id: shmid,
        };
        let existing = state.resources.entry(mrid).or_default().first().cloned();
        let resource = match existing {
            Some(resource) => resource,
            None => {
                let resource = MappedResource::shm(shmid, len);
                state
                    .resources
                    .get_mut(&mrid)
                    .unwrap()
                    .push(Arc::clone(&resource));
                resource
            }
        };
        state.track_range(
            addr,
            VmaEntry {
                len,
                prot,
                flags: MapFlags::SHARED,
                resource: Some(resource),
                offset: 0,
            },
        );
    }

    /// Detach a shm segment; returns the detached length for invalidation.
    pub fn track_shmdt(&self, addr: u64) -> u64 {
        let mut state = self.state.write().unwrap();
        let Some((base, entry)) = state.find(addr).map(|(b, e)| (b, e.clone())) else {
            return 0;
        };
        if base != addr {
            return 0;
        }
        let len = entry
            .resource
            .as_ref()
            .and_then(|r| r.shm_length)
            .unwrap_or(entry.len);
        state.delete_range(addr, len);
        len
    }

    /// madvise is observed but carries no tracking consequence today.
    pub fn track_madvise(&self, _addr: u64, _len: u64, _advice: i32) {
        let _guard = self.state.read().unwrap();
    }

    /// Look up the entry containing `addr`.
    #[must_use]
    pub fn query(&self, addr: u64) -> Option<(u64, VmaEntry)> {
        let state = self.state.read().unwrap();
        state.find(addr).map(|(b, e)| (b, e.clone()))
    }

    /// Executable-range query for the translator: `(base, len, writable)`.
    #[must_use]
    pub fn query_executable_range(&self, addr: u64) -> Option<(u64, u64, bool)> {
        let state = self.state.read().unwrap();
        let (base, entry) = state.find(addr)?;
        if !entry.prot.executable() {
            return None;
        }
        Some((base, entry.len, entry.prot.writable()))
    }

    /// Number of distinct resource instances for a given key (test
    /// visibility into ELF re-mapping behavior).
    #[must_use]
    pub fn resource_instances(&self, dev: u64, inode: u64) -> usize {
        let state = self.state.read().unwrap();
        state
            .resources
            .get(&Mrid {
                dev: SpecialDev::Dev(dev),
                id: inode,
            })
            .map_or(0, Vec::len)
    }

    /// Whether `[addr, addr+len)` intersects a guest RWX range.
    #[must_use]
    pub fn intersects_rwx(&self, addr: u64, len: u64) -> bool {
        self.rwx.lock().unwrap().intersects(addr, addr + len)
    }

    /// The executable file section containing `addr`, for AOT-cache
    /// attribution.
    #[must_use]
    pub fn executable_section_for(&self, addr: u64) -> Option<crate::ExecutableSection> {
        let state = self.state.read().unwrap();
        let (base, entry) = state.find(addr)?;
        let resource = entry.resource.as_ref()?;
        let file = resource.file.clone()?;
        let image_base = instance_base(&state, resource)?;
        Some(crate::ExecutableSection {
            file,
            image_base,
            start: base,
            end: base + entry.len,
        })
    }

    /// Page-aligned code invalidation for mutators (mmap/mprotect/munmap
    /// notification paths). Must be called *after* the map lock is
    /// released; the invalidator takes the code-invalidation lock itself.
    pub fn invalidate_guest_code_range(
        &self,
        addr: u64,
        len: u64,
        invalidator: &dyn CodeInvalidator,
    ) {
        if len == 0 {
            return;
        }
        let base = page_align_down(addr);
        let top = page_align_up(addr + len);
        invalidator.invalidate_code_range(base, top - base);
    }

    /// The JIT is about to translate from `[start, start+len)`: downgrade
    /// every writable page backing it (including shared aliases) to
    /// read-only so the first guest write faults into
    /// [`VmaTracker::handle_segfault`].
    pub fn mark_guest_executable_range(
        &self,
        start: u64,
        len: u64,
        host: &dyn HostMem,
    ) {
        let base = page_align_down(start);
        let top = page_align_up(start + len);

        let state = self.state.read().unwrap();
        let overlapping: Vec<(u64, VmaEntry)> = state
            .vmas
            .range(..top)
            .filter(|(&vma_base, entry)| vma_base + entry.len > base)
            .map(|(&b, e)| (b, e.clone()))
            .collect();

        for (vma_base, entry) in overlapping {
            let protect_base = vma_base.max(base);
            let protect_end = (vma_base + entry.len).min(top);

            if entry.flags.shared() {
                let Some(resource) = entry.resource.as_ref() else {
                    continue;
                };
                let offset_base = protect_base - vma_base + entry.offset;
                let offset_top = offset_base + (protect_end - protect_base);
                for (mirror_base, mirror) in state.mirrors_of(resource) {
                    if !mirror.prot.writable() {
                        continue;
                    }
                    let mirror_off_base = mirror.offset;
                    let mirror_off_top = mirror.offset + mirror.len;
                    if mirror_off_base < offset_top && mirror_off_top > offset_base {
                        let from = mirror_off_base.max(offset_base);
                        let to = mirror_off_top.min(offset_top);
                        let addr = from - mirror_off_base + mirror_base;
                        if let Err(err) = host.protect(addr, to - from, Prot::READ) {
                            warn!(addr, error = %err, "mprotect to read-only failed");
                        }
                    }
                }
            } else if entry.prot.writable() {
                if let Err(err) =
                    host.protect(protect_base, protect_end - protect_base, Prot::READ)
                {
                    warn!(protect_base, error = %err, "mprotect to read-only failed");
                }
            }
        }
    }

    /// Route a host write fault. Shared-reader lock only: the fault path
    /// must never block behind mutators.
    pub fn handle_segfault(
        &self,
        fault_addr: u64,
        invalidator: &dyn CodeInvalidator,
        host: &dyn HostMem,
        block_query: Option<&dyn CurrentBlockQuery>,
        host_pc: u64,
    ) -> SegfaultOutcome {
        let state = self.state.read().unwrap();

        let Some((base, entry)) = state.find(fault_addr) else {
            return SegfaultOutcome::NotHandled;
        };
        if !entry.prot.writable() {
            // The guest mapping really is read-only; this fault is a guest
            // exception, not an SMC event.
            return SegfaultOutcome::NotHandled;
        }

        let fault_page = page_align_down(fault_addr);
        debug!(fault_page, "SMC write fault");

        if entry.flags.shared() {
            let resource = entry
                .resource
                .as_ref()
                .expect("shared mapping without a resource");
            let offset = fault_page - base + entry.offset;
            // The write may have come through a different alias; flush all
            // mirrors and reopen the writable ones.
            for (mirror_base, mirror) in state.mirrors_of(resource) {
                if mirror.offset <= offset && offset < mirror.offset + mirror.len {
                    let mirrored_page = offset - mirror.offset + mirror_base;
                    invalidator.invalidate_code_range(mirrored_page, PAGE_SIZE);
                    if mirror.prot.writable() {
                        if let Err(err) =
                            host.protect(mirrored_page, PAGE_SIZE, Prot::READ | Prot::WRITE)
                        {
                            warn!(mirrored_page, error = %err, "mprotect to read-write failed");
                        }
                    }
                }
            }
        } else {
            invalidator.invalidate_code_range(fault_page, PAGE_SIZE);
            if let Err(err) = host.protect(fault_page, PAGE_SIZE, Prot::READ | Prot::WRITE) {
                warn!(fault_page, error = %err, "mprotect to read-write failed");
            }
        }

        // If the faulting store sits inside the block being executed, the
        // re-execution must run as a single-instruction block so any
        // further SMC is picked up immediately.
        let single_step = block_query.is_some_and(|q| {
            q.host_pc_in_code_buffer(host_pc)
                && !q.current_block_is_single_inst()
                && q.current_block_intersects(fault_page, PAGE_SIZE)
        });

        SegfaultOutcome::Handled { single_step }
    }
}

fn instance_base(state: &VmaState, resource: &Arc<MappedResource>) -> Option<u64> {
    state
        .vmas
        .iter()
        .find(|(_, e)| {
            e.resource
                .as_ref()
                .is_some_and(|r| Arc::ptr_eq(r, resource))
        })
        .map(|(&b, _)| b)
}
