use pouch_core::{ConnHandle, ConnKey, GatewayError};

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<(ConnHandle, T)>,
}

/// Fixed-capacity table of live connections.
///
/// Slots are reused, but every reuse bumps the slot's generation, so a
/// `ConnKey` issued for an earlier occupant no longer resolves.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> ConnectionTable<T> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        Self { slots }
    }

    /// Places a new connection in a free slot, building it from its key.
    pub fn insert(
        &mut self,
        conn: ConnHandle,
        make: impl FnOnce(ConnKey) -> T,
    ) -> Result<ConnKey, GatewayError> {
        let capacity = self.slots.len();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.entry.is_none())
            .ok_or_else(|| GatewayError::exhausted(format!("all {capacity} connection slots in use")))?;
        slot.generation = slot.generation.wrapping_add(1);
        let key = ConnKey {
            slot: index as u16,
            generation: slot.generation,
        };
        slot.entry = Some((conn, make(key)));
        Ok(key)
    }

    fn slot(&self, key: ConnKey) -> Option<&Slot<T>> {
        self.slots
            .get(usize::from(key.slot))
            .filter(|slot| slot.generation == key.generation)
    }

    pub fn get(&self, key: ConnKey) -> Option<&T> {
        self.slot(key)?.entry.as_ref().map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: ConnKey) -> Option<&mut T> {
        self.slots
            .get_mut(usize::from(key.slot))
            .filter(|slot| slot.generation == key.generation)?
            .entry
            .as_mut()
            .map(|(_, value)| value)
    }

    pub fn handle(&self, key: ConnKey) -> Option<ConnHandle> {
        self.slot(key)?.entry.as_ref().map(|(conn, _)| *conn)
    }

    /// Key of the live connection using radio handle `conn`.
    pub fn key_for(&self, conn: ConnHandle) -> Option<ConnKey> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match &slot.entry {
            Some((handle, _)) if *handle == conn => Some(ConnKey {
                slot: index as u16,
                generation: slot.generation,
            }),
            _ => None,
        })
    }

    pub fn remove(&mut self, key: ConnKey) -> Option<T> {
        self.slots
            .get_mut(usize::from(key.slot))
            .filter(|slot| slot.generation == key.generation)?
            .entry
            .take()
            .map(|(_, value)| value)
    }

    pub fn keys(&self) -> Vec<ConnKey> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| ConnKey {
                slot: index as u16,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
