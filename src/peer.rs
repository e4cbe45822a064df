//! The peer table.
//!
//! Peers live in an arena of slots and are addressed through generation checked [PeerHandle]s.
//! Two indices point into the arena: a hash table keyed by MAC address and a dense map from
//! firmware assigned peer IDs. Neither index owns the peer. Ownership is expressed by a reference
//! count, which every [PeerRef] holds one unit of. The attach reference and every mapped peer ID
//! hold one unit as well.
//!
//! The count is only ever raised from zero at attach time. Lookups increment it while
//! holding the table lock, and the transition to zero also happens under that lock, immediately
//! followed by unlinking the peer from both indices. A lookup can therefore never return a peer,
//! that is being destroyed.

use alloc::{sync::Arc, vec::Vec};
use core::{cell::RefCell, fmt, ops::Deref};

use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::{
    error::{TxRxError, TxRxResult},
    ieee80211::{MacAddr, NUM_TIDS},
    DefaultRawMutex,
};

/// The number of peer IDs a single peer can hold.
pub const MAX_NUM_PEER_ID_PER_PEER: usize = 8;

/// A generation checked index into the peer arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

/// Tx state of one traffic identifier.
#[derive(Default)]
pub struct TidState {
    paused: AtomicBool,
    in_flight: AtomicU32,
    sent: AtomicU32,
}
impl TidState {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
    /// Frames handed to the transport, for which no completion was seen yet.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }
    /// Frames handed to the transport in total.
    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }
    pub(crate) fn on_submit(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_completion(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// A station associated with one of our vdevs.
pub struct Peer {
    mac: MacAddr,
    vdev_id: u8,
    handle: PeerHandle,
    ref_cnt: AtomicU32,
    valid: AtomicBool,
    authorized: AtomicBool,
    qos_capable: AtomicBool,
    detached: AtomicBool,
    tids: [TidState; NUM_TIDS],
}
impl Peer {
    pub fn mac(&self) -> MacAddr {
        self.mac
    }
    /// The vdev this peer belongs to. This doesn't keep the vdev alive.
    pub fn vdev_id(&self) -> u8 {
        self.vdev_id
    }
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }
    pub fn ref_cnt(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }
    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }
    pub(crate) fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::Release);
    }
    pub fn is_qos_capable(&self) -> bool {
        self.qos_capable.load(Ordering::Relaxed)
    }
    pub fn set_qos_capable(&self, qos_capable: bool) {
        self.qos_capable.store(qos_capable, Ordering::Relaxed);
    }
    /// State of `tid`. Out of range TIDs map to the management TID.
    pub fn tid(&self, tid: u8) -> &TidState {
        &self.tids[(tid as usize).min(NUM_TIDS - 1)]
    }
}
impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("mac", &self.mac)
            .field("vdev_id", &self.vdev_id)
            .field("ref_cnt", &self.ref_cnt())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A counted reference to a [Peer].
///
/// The peer can't be destroyed while this exists. Dropping it releases the reference, which
/// destroys the peer, if it was the last one.
pub struct PeerRef {
    table: Arc<PeerTableShared>,
    peer: Arc<Peer>,
    /// Cleared when the reference was handed over to an index.
    counted: bool,
}
impl PeerRef {
    fn new(table: Arc<PeerTableShared>, peer: Arc<Peer>) -> Self {
        Self {
            table,
            peer,
            counted: true,
        }
    }
    /// Give up this handle without releasing the count it represents.
    fn hand_over(mut self) {
        self.counted = false;
    }
}
impl Deref for PeerRef {
    type Target = Peer;
    fn deref(&self) -> &Self::Target {
        &self.peer
    }
}
impl Clone for PeerRef {
    fn clone(&self) -> Self {
        // We already hold a reference, so the count can't be zero here.
        self.peer.ref_cnt.fetch_add(1, Ordering::AcqRel);
        Self::new(self.table.clone(), self.peer.clone())
    }
}
impl Drop for PeerRef {
    fn drop(&mut self) {
        if self.counted {
            self.table.release(&self.peer);
        }
    }
}
impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.peer, f)
    }
}

struct PeerEntry {
    peer: Arc<Peer>,
    ids: [Option<u16>; MAX_NUM_PEER_ID_PER_PEER],
    in_hash: bool,
}

#[derive(Clone, Copy, Default)]
struct IdMapEntry {
    handle: Option<PeerHandle>,
    /// Number of map events seen for this ID.
    id_ref_cnt: u32,
}

struct PeerTableState {
    entries: Vec<Option<PeerEntry>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
    bins: Vec<Vec<PeerHandle>>,
    id_map: Vec<IdMapEntry>,
}
impl PeerTableState {
    fn entry(&self, handle: PeerHandle) -> Option<&PeerEntry> {
        if self.generations.get(handle.index as usize) != Some(&handle.generation) {
            return None;
        }
        self.entries.get(handle.index as usize)?.as_ref()
    }
    fn entry_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerEntry> {
        if self.generations.get(handle.index as usize) != Some(&handle.generation) {
            return None;
        }
        self.entries.get_mut(handle.index as usize)?.as_mut()
    }
    fn remove_from_bin(&mut self, bin: usize, handle: PeerHandle) -> bool {
        let Some(bin) = self.bins.get_mut(bin) else {
            return false;
        };
        // Vec::remove keeps the remaining entries in insertion order.
        match bin.iter().position(|h| *h == handle) {
            Some(pos) => {
                bin.remove(pos);
                true
            }
            None => false,
        }
    }
    /// Remove the peer from all indices and free its slot.
    fn unlink(&mut self, handle: PeerHandle, bin: usize) -> Option<PeerEntry> {
        self.entry(handle)?;
        let entry = self.entries[handle.index as usize].take()?;
        if entry.in_hash {
            self.remove_from_bin(bin, handle);
        }
        for id in entry.ids.iter().flatten() {
            if let Some(slot) = self.id_map.get_mut(*id as usize) {
                if slot.handle == Some(handle) {
                    *slot = IdMapEntry::default();
                }
            }
        }
        let generation = &mut self.generations[handle.index as usize];
        *generation = generation.wrapping_add(1);
        self.free_slots.push(handle.index);
        Some(entry)
    }
}

pub(crate) struct PeerTableShared {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<PeerTableState>>,
    hash_mask: usize,
    hash_bits: u32,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    id_overflows: AtomicUsize,
}
impl PeerTableShared {
    fn hash_index(&self, mac: &MacAddr) -> usize {
        let [a, b, c, d, e, f] = mac.0;
        let mut index = (u16::from_ne_bytes([a, b])
            ^ u16::from_ne_bytes([c, d])
            ^ u16::from_ne_bytes([e, f])) as usize;
        index ^= index >> self.hash_bits;
        index & self.hash_mask
    }
    fn release(&self, peer: &Arc<Peer>) {
        let mut current = peer.ref_cnt.load(Ordering::Acquire);
        while current > 1 {
            match peer.ref_cnt.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
        // This might be the last reference, so the decrement has to be serialized against
        // lookups.
        let bin = self.hash_index(&peer.mac);
        let destroyed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            // The peer may already be gone, if the table was erased underneath us.
            state.entry(peer.handle)?;
            if peer.ref_cnt.fetch_sub(1, Ordering::AcqRel) != 1 {
                return None;
            }
            state.unlink(peer.handle, bin)
        });
        if destroyed.is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            debug!("Peer {} destroyed.", peer.mac);
        }
    }
}

/// The hash table and peer ID map of one physical device.
pub struct PeerTable {
    shared: Arc<PeerTableShared>,
}
impl PeerTable {
    /// Allocate a table for `max_peers` peers and peer IDs up to `max_peer_id`.
    ///
    /// The hash table has about twice as many bins as peers, so that most bins stay empty and
    /// address comparisons are rare.
    pub fn new(max_peers: usize, max_peer_id: u16) -> TxRxResult<Self> {
        let num_bins = max_peers
            .checked_add(1)
            .and_then(|n| n.checked_mul(2))
            .and_then(usize::checked_next_power_of_two)
            .ok_or(TxRxError::OutOfMemory)?;
        let num_ids = max_peer_id as usize + 1;

        let mut entries = Vec::new();
        let mut generations = Vec::new();
        let mut free_slots = Vec::new();
        let mut bins = Vec::new();
        let mut id_map = Vec::new();
        entries
            .try_reserve_exact(max_peers)
            .and_then(|_| generations.try_reserve_exact(max_peers))
            .and_then(|_| free_slots.try_reserve_exact(max_peers))
            .and_then(|_| bins.try_reserve_exact(num_bins))
            .and_then(|_| id_map.try_reserve_exact(num_ids))
            .map_err(|_| TxRxError::OutOfMemory)?;
        entries.resize_with(max_peers, || None);
        generations.resize(max_peers, 0);
        // Popping from the back hands out the low slots first.
        free_slots.extend((0..max_peers as u32).rev());
        bins.resize_with(num_bins, Vec::new);
        id_map.resize(num_ids, IdMapEntry::default());

        debug!(
            "Peer table attached with {} bins and {} peer IDs.",
            num_bins,
            num_ids
        );
        Ok(Self {
            shared: Arc::new(PeerTableShared {
                state: blocking_mutex::Mutex::new(RefCell::new(PeerTableState {
                    entries,
                    generations,
                    free_slots,
                    bins,
                    id_map,
                })),
                hash_mask: num_bins - 1,
                hash_bits: num_bins.trailing_zeros(),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                id_overflows: AtomicUsize::new(0),
            }),
        })
    }
    pub fn num_bins(&self) -> usize {
        self.shared.hash_mask + 1
    }
    /// Create a peer and append it to the tail of its hash bin.
    ///
    /// The peer starts out with two references: the attach reference, which is dropped by
    /// [PeerTable::detach], and the returned one. If a peer with the same address already exists,
    /// the new one is found only after the old one is gone.
    pub fn attach(&self, vdev_id: u8, mac: MacAddr, qos_capable: bool) -> TxRxResult<PeerRef> {
        let bin = self.shared.hash_index(&mac);
        let peer = self.shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.free_slots.pop().ok_or(TxRxError::OutOfMemory)?;
            let handle = PeerHandle {
                index,
                generation: state.generations[index as usize],
            };
            let peer = Arc::new(Peer {
                mac,
                vdev_id,
                handle,
                ref_cnt: AtomicU32::new(2),
                valid: AtomicBool::new(false),
                authorized: AtomicBool::new(false),
                qos_capable: AtomicBool::new(qos_capable),
                detached: AtomicBool::new(false),
                tids: Default::default(),
            });
            state.entries[index as usize] = Some(PeerEntry {
                peer: peer.clone(),
                ids: [None; MAX_NUM_PEER_ID_PER_PEER],
                in_hash: true,
            });
            state.bins[bin].push(handle);
            Ok(peer)
        })?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        debug!("Peer {} attached to vdev {}.", mac, vdev_id);
        Ok(PeerRef::new(self.shared.clone(), peer))
    }
    /// Drop the attach reference of the peer.
    ///
    /// The peer is marked invalid right away, but is only destroyed once all other references
    /// are gone.
    pub fn detach(&self, handle: PeerHandle) -> TxRxResult<()> {
        let peer = self
            .shared
            .state
            .lock(|state| state.borrow().entry(handle).map(|entry| entry.peer.clone()))
            .ok_or(TxRxError::NotFound)?;
        if peer.detached.swap(true, Ordering::AcqRel) {
            return Err(TxRxError::NotFound);
        }
        peer.set_valid(false);
        debug!("Peer {} detached.", peer.mac);
        self.shared.release(&peer);
        Ok(())
    }
    /// Look up a peer by address.
    ///
    /// Bins are scanned in insertion order, so the earliest surviving entry wins, if multiple
    /// peers match. The reference count is incremented before the lock is released.
    pub fn find(&self, mac: &MacAddr, vdev_id: Option<u8>, valid_only: bool) -> Option<PeerRef> {
        let bin = self.shared.hash_index(mac);
        let peer = self.shared.state.lock(|state| {
            let state = state.borrow();
            state.bins[bin].iter().find_map(|handle| {
                let peer = &state.entry(*handle)?.peer;
                if peer.mac != *mac
                    || vdev_id.is_some_and(|vdev_id| vdev_id != peer.vdev_id)
                    || (valid_only && !peer.is_valid())
                {
                    return None;
                }
                peer.ref_cnt.fetch_add(1, Ordering::AcqRel);
                Some(peer.clone())
            })
        })?;
        Some(PeerRef::new(self.shared.clone(), peer))
    }
    /// Look up a peer by its handle.
    pub fn get(&self, handle: PeerHandle) -> Option<PeerRef> {
        let peer = self.shared.state.lock(|state| {
            let state = state.borrow();
            let peer = &state.entry(handle)?.peer;
            peer.ref_cnt.fetch_add(1, Ordering::AcqRel);
            Some(peer.clone())
        })?;
        Some(PeerRef::new(self.shared.clone(), peer))
    }
    /// Remove the peer from its hash bin, so it can't be found by address anymore.
    ///
    /// Returns `false`, if it wasn't in the hash table.
    pub fn hash_remove(&self, peer: &Peer) -> bool {
        let bin = self.shared.hash_index(&peer.mac);
        self.shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.entry_mut(peer.handle) {
                Some(entry) if entry.in_hash => entry.in_hash = false,
                _ => return false,
            }
            state.remove_from_bin(bin, peer.handle)
        })
    }
    /// Destroy every peer, regardless of outstanding references.
    ///
    /// This is only meant for teardown, when the table is known to be unreachable. References,
    /// which still exist afterwards, become inert.
    pub fn erase_all(&self) -> usize {
        let erased = self.shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            let handles: Vec<(PeerHandle, usize)> = state
                .entries
                .iter()
                .flatten()
                .map(|entry| (entry.peer.handle, self.shared.hash_index(&entry.peer.mac)))
                .collect();
            handles
                .into_iter()
                .filter_map(|(handle, bin)| state.unlink(handle, bin))
                .map(|entry| entry.peer.ref_cnt.store(0, Ordering::Release))
                .count()
        });
        self.shared.destroyed.fetch_add(erased, Ordering::Relaxed);
        info!("Erased {} peers.", erased);
        erased
    }

    /// Attach `peer_id` to the peer with address `mac`.
    ///
    /// The ID holds a reference to the peer until it's unmapped. Repeated map events for the same
    /// ID are counted, and only the last unmap releases the peer. Returns `true`, if the ID was
    /// newly attached.
    pub fn add_id(&self, mac: &MacAddr, peer_id: u16) -> TxRxResult<bool> {
        if peer_id as usize >= self.max_peer_ids() {
            return Err(TxRxError::InvalidPeerId);
        }
        let peer = self.find(mac, None, false).ok_or(TxRxError::NotFound)?;
        let handle = peer.handle;
        let res = self.shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            let slot = state.id_map[peer_id as usize];
            match slot.handle {
                Some(existing) if existing == handle => {
                    state.id_map[peer_id as usize].id_ref_cnt += 1;
                    return Ok(false);
                }
                Some(_) => return Err(TxRxError::InvalidPeerId),
                None => {}
            }
            let entry = state.entry_mut(handle).ok_or(TxRxError::NotFound)?;
            let free = entry
                .ids
                .iter_mut()
                .find(|id| id.is_none())
                .ok_or(TxRxError::TooManyIds)?;
            *free = Some(peer_id);
            state.id_map[peer_id as usize] = IdMapEntry {
                handle: Some(handle),
                id_ref_cnt: 1,
            };
            Ok(true)
        });
        match res {
            Ok(true) => {
                // The ID keeps the reference taken by the lookup.
                peer.hand_over();
            }
            Err(TxRxError::TooManyIds) => {
                self.shared.id_overflows.fetch_add(1, Ordering::Relaxed);
                warn!("Peer {} has no room for peer ID {}.", mac, peer_id);
            }
            Err(TxRxError::InvalidPeerId) => {
                warn!("Peer ID {} is already mapped to another peer.", peer_id);
            }
            _ => {}
        }
        res
    }
    /// Look up a peer by one of its IDs.
    pub fn id_to_peer(&self, peer_id: u16) -> Option<PeerRef> {
        let peer = self.shared.state.lock(|state| {
            let state = state.borrow();
            let handle = state.id_map.get(peer_id as usize)?.handle?;
            let peer = &state.entry(handle)?.peer;
            peer.ref_cnt.fetch_add(1, Ordering::AcqRel);
            Some(peer.clone())
        })?;
        Some(PeerRef::new(self.shared.clone(), peer))
    }
    /// Handle an unmap event for `peer_id`.
    ///
    /// Returns `true`, if this was the last mapping and the ID was detached from the peer.
    pub fn id_unmap(&self, peer_id: u16) -> TxRxResult<bool> {
        let detached = self.shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            let slot = state
                .id_map
                .get_mut(peer_id as usize)
                .ok_or(TxRxError::InvalidPeerId)?;
            let handle = slot.handle.ok_or(TxRxError::NotFound)?;
            slot.id_ref_cnt = slot.id_ref_cnt.saturating_sub(1);
            if slot.id_ref_cnt != 0 {
                return Ok(None);
            }
            *slot = IdMapEntry::default();
            let entry = state.entry_mut(handle).ok_or(TxRxError::NotFound)?;
            if let Some(id) = entry.ids.iter_mut().find(|id| **id == Some(peer_id)) {
                *id = None;
            }
            Ok(Some(entry.peer.clone()))
        })?;
        match detached {
            Some(peer) => {
                debug!("Peer ID {} unmapped from {}.", peer_id, peer.mac);
                self.shared.release(&peer);
                Ok(true)
            }
            None => Ok(false),
        }
    }
    /// The IDs currently attached to the peer.
    pub fn peer_ids(&self, handle: PeerHandle) -> [Option<u16>; MAX_NUM_PEER_ID_PER_PEER] {
        self.shared.state.lock(|state| {
            state
                .borrow()
                .entry(handle)
                .map(|entry| entry.ids)
                .unwrap_or([None; MAX_NUM_PEER_ID_PER_PEER])
        })
    }
    /// Handles of all live peers, optionally limited to one vdev.
    pub fn handles(&self, vdev_id: Option<u8>) -> Vec<PeerHandle> {
        self.shared.state.lock(|state| {
            state
                .borrow()
                .entries
                .iter()
                .flatten()
                .filter(|entry| vdev_id.is_none_or(|vdev_id| vdev_id == entry.peer.vdev_id))
                .map(|entry| entry.peer.handle)
                .collect()
        })
    }
    pub fn max_peer_ids(&self) -> usize {
        self.shared.state.lock(|state| state.borrow().id_map.len())
    }
    pub fn live_peers(&self) -> usize {
        self.shared
            .state
            .lock(|state| state.borrow().entries.iter().flatten().count())
    }
    pub fn peers_created(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }
    pub fn peers_destroyed(&self) -> usize {
        self.shared.destroyed.load(Ordering::Relaxed)
    }
    pub fn id_overflows(&self) -> usize {
        self.shared.id_overflows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::*;

    const MAC_A: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const MAC_B: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

    #[test]
    fn bin_count_is_power_of_two() {
        assert_eq!(PeerTable::new(32, 255).unwrap().num_bins(), 128);
        assert_eq!(PeerTable::new(3, 255).unwrap().num_bins(), 8);
    }

    #[test]
    fn find_counts_references() {
        let table = PeerTable::new(4, 15).unwrap();
        let peer = table.attach(0, MAC_A, true).unwrap();
        assert_eq!(peer.ref_cnt(), 2);
        let found = table.find(&MAC_A, None, false).unwrap();
        assert_eq!(peer.ref_cnt(), 3);
        drop(found);
        assert_eq!(peer.ref_cnt(), 2);
        assert!(table.find(&MAC_B, None, false).is_none());
        assert!(table.find(&MAC_A, Some(1), false).is_none());
        assert!(table.find(&MAC_A, None, true).is_none());
        peer.set_valid(true);
        assert!(table.find(&MAC_A, Some(0), true).is_some());
    }

    #[test]
    fn last_release_destroys() {
        let table = PeerTable::new(4, 15).unwrap();
        let peer = table.attach(0, MAC_A, false).unwrap();
        let handle = peer.handle();
        let extra = peer.clone();
        table.detach(handle).unwrap();
        assert_eq!(table.detach(handle), Err(TxRxError::NotFound));
        // The lookup still sees the peer, but it's no longer valid.
        assert!(table.find(&MAC_A, None, true).is_none());
        drop(peer);
        assert_eq!(table.peers_destroyed(), 0);
        drop(extra);
        assert_eq!(table.peers_destroyed(), 1);
        assert!(table.find(&MAC_A, None, false).is_none());
        assert!(table.get(handle).is_none());
        assert_eq!(table.live_peers(), 0);
    }

    #[test]
    fn duplicates_resolve_to_earliest() {
        let table = PeerTable::new(4, 15).unwrap();
        let first = table.attach(0, MAC_A, false).unwrap();
        let second = table.attach(0, MAC_A, false).unwrap();
        for _ in 0..3 {
            let found = table.find(&MAC_A, Some(0), false).unwrap();
            assert_eq!(found.handle(), first.handle());
        }
        let first_handle = first.handle();
        table.detach(first_handle).unwrap();
        drop(first);
        let found = table.find(&MAC_A, Some(0), false).unwrap();
        assert_eq!(found.handle(), second.handle());
    }

    #[test]
    fn hash_remove_hides_peer() {
        let table = PeerTable::new(4, 15).unwrap();
        let peer = table.attach(0, MAC_A, false).unwrap();
        assert!(table.hash_remove(&peer));
        assert!(!table.hash_remove(&peer));
        assert!(table.find(&MAC_A, None, false).is_none());
        assert!(table.get(peer.handle()).is_some());
    }

    #[test]
    fn table_full() {
        let table = PeerTable::new(1, 15).unwrap();
        let _peer = table.attach(0, MAC_A, false).unwrap();
        assert_eq!(
            table.attach(0, MAC_B, false).err(),
            Some(TxRxError::OutOfMemory)
        );
    }

    #[test]
    fn peer_ids() {
        let table = PeerTable::new(4, 15).unwrap();
        let peer = table.attach(0, MAC_A, false).unwrap();
        let handle = peer.handle();
        assert_eq!(table.add_id(&MAC_A, 3), Ok(true));
        assert_eq!(peer.ref_cnt(), 3);
        // A second map event for the same ID doesn't take another reference.
        assert_eq!(table.add_id(&MAC_A, 3), Ok(false));
        assert_eq!(peer.ref_cnt(), 3);
        assert_eq!(table.add_id(&MAC_B, 4), Err(TxRxError::NotFound));
        assert_eq!(table.add_id(&MAC_A, 16), Err(TxRxError::InvalidPeerId));

        assert_eq!(table.id_to_peer(3).unwrap().handle(), handle);
        assert!(table.id_to_peer(4).is_none());

        assert_eq!(table.id_unmap(3), Ok(false));
        assert_eq!(peer.ref_cnt(), 3);
        assert_eq!(table.id_unmap(3), Ok(true));
        assert_eq!(peer.ref_cnt(), 2);
        assert!(table.id_to_peer(3).is_none());
        assert_eq!(table.id_unmap(3), Err(TxRxError::NotFound));
    }

    #[test]
    fn id_slots_overflow() {
        let table = PeerTable::new(4, 31).unwrap();
        let peer = table.attach(0, MAC_A, false).unwrap();
        for id in 0..MAX_NUM_PEER_ID_PER_PEER as u16 {
            assert_eq!(table.add_id(&MAC_A, id), Ok(true));
        }
        assert_eq!(
            table.add_id(&MAC_A, MAX_NUM_PEER_ID_PER_PEER as u16),
            Err(TxRxError::TooManyIds)
        );
        assert_eq!(table.id_overflows(), 1);
        assert_eq!(peer.ref_cnt(), 2 + MAX_NUM_PEER_ID_PER_PEER as u32);
    }

    #[test]
    fn unmapping_last_reference_destroys() {
        let table = PeerTable::new(4, 15).unwrap();
        let peer = table.attach(0, MAC_A, false).unwrap();
        table.add_id(&MAC_A, 1).unwrap();
        table.detach(peer.handle()).unwrap();
        drop(peer);
        assert_eq!(table.live_peers(), 1);
        assert!(table.id_unmap(1).unwrap());
        assert_eq!(table.live_peers(), 0);
        assert_eq!(table.peers_destroyed(), 1);
    }

    #[test]
    fn erase_all_makes_references_inert() {
        let table = PeerTable::new(4, 15).unwrap();
        let a = table.attach(0, MAC_A, false).unwrap();
        let b = table.attach(1, MAC_B, false).unwrap();
        table.add_id(&MAC_B, 2).unwrap();
        assert_eq!(table.erase_all(), 2);
        assert_eq!(table.live_peers(), 0);
        assert!(table.id_to_peer(2).is_none());
        drop(a);
        drop(b);
        assert_eq!(table.peers_destroyed(), 2);
        // Freed slots are reused with a new generation.
        let c = table.attach(0, MAC_A, false).unwrap();
        assert_eq!(c.ref_cnt(), 2);
    }

    #[test]
    fn uniqueness_under_churn() {
        let table = PeerTable::new(8, 15).unwrap();
        for _ in 0..50 {
            let peer = table.attach(0, MAC_A, false).unwrap();
            let found = table.find(&MAC_A, Some(0), false).unwrap();
            assert_eq!(found.handle(), peer.handle());
            assert_eq!(table.handles(Some(0)).len(), 1);
            drop(found);
            table.detach(peer.handle()).unwrap();
            drop(peer);
            assert!(table.find(&MAC_A, Some(0), false).is_none());
        }
        assert_eq!(table.peers_destroyed(), 50);
    }

    #[test]
    fn concurrent_lookups_against_release() {
        for _ in 0..20 {
            let table = Arc::new(PeerTable::new(4, 15).unwrap());
            let peer = table.attach(0, MAC_A, false).unwrap();
            let handle = peer.handle();
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let table = table.clone();
                    thread::spawn(move || {
                        for _ in 0..500 {
                            if let Some(found) = table.find(&MAC_A, None, false) {
                                assert_eq!(found.mac(), MAC_A);
                                assert!(found.ref_cnt() >= 1);
                                let again = found.clone();
                                drop(found);
                                drop(again);
                            }
                        }
                    })
                })
                .collect();
            table.detach(handle).unwrap();
            drop(peer);
            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(table.peers_destroyed(), 1);
            assert_eq!(table.live_peers(), 0);
            assert!(table.find(&MAC_A, None, false).is_none());
        }
    }
}
