//! The environment table.

use abyss::{
    EnvId, EnvStatus, KernelError, Pde, Pte, PteFlags, Va,
    env::{ENV_GEN_SHIFT, NENV},
};
use std::collections::{BTreeMap, BTreeSet};

/// The user half of one environment's page table.
///
/// A page table, once created for a 4 MiB region, stays even when it no
/// longer maps anything.
#[derive(Default)]
pub(crate) struct AddressSpace {
    tables: BTreeSet<usize>,
    ptes: BTreeMap<usize, Pte>,
}

impl AddressSpace {
    pub(crate) fn pde(&self, pdx: usize) -> Pde {
        if self.tables.contains(&pdx) {
            Pde((PteFlags::P | PteFlags::W | PteFlags::U).bits())
        } else {
            Pde::EMPTY
        }
    }

    pub(crate) fn pte(&self, pn: usize) -> Pte {
        self.ptes.get(&pn).copied().unwrap_or(Pte::EMPTY)
    }

    /// Install `pte` for `va`, returning the entry it replaced.
    pub(crate) fn insert(&mut self, va: Va, pte: Pte) -> Option<Pte> {
        self.tables.insert(va.pdx());
        self.ptes.insert(va.pn(), pte)
    }

    pub(crate) fn remove(&mut self, va: Va) -> Option<Pte> {
        self.ptes.remove(&va.pn())
    }

    /// Every mapped page, in address order.
    pub(crate) fn mappings(&self) -> impl Iterator<Item = (Va, Pte)> + '_ {
        self.ptes
            .iter()
            .filter_map(|(pn, pte)| Some((Va::from_pn(*pn)?, *pte)))
    }

    pub(crate) fn take(&mut self) -> Vec<Pte> {
        self.tables.clear();
        std::mem::take(&mut self.ptes).into_values().collect()
    }
}

/// One slot of the environment table.
pub(crate) struct EnvSlot {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub space: AddressSpace,
    /// Raw address of the registered page fault upcall.
    pub upcall: Option<usize>,
    /// Set by `exofork` in the child: its first `exofork` returns 0.
    pub pending_exofork: bool,
    /// Whether the page fault upcall is running.
    pub in_upcall: bool,
}

pub(crate) struct EnvTable {
    slots: Vec<Option<EnvSlot>>,
    last_ids: Vec<u32>,
}

impl EnvTable {
    pub(crate) fn new(max_envs: usize) -> Self {
        let max_envs = max_envs.min(NENV);
        Self {
            slots: (0..max_envs).map(|_| None).collect(),
            last_ids: vec![0; max_envs],
        }
    }

    /// Take a free slot and give it a fresh identifier.
    ///
    /// The generation part of the identifier grows on every reuse of a slot,
    /// so identifiers of destroyed environments stay dead.
    pub(crate) fn alloc(&mut self, parent: EnvId) -> Result<&mut EnvSlot, KernelError> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoFreeEnv)?;
        let mut generation =
            self.last_ids[idx].wrapping_add(1 << ENV_GEN_SHIFT) & !(NENV as u32 - 1);
        if generation == 0 || generation > i32::MAX as u32 {
            generation = 1 << ENV_GEN_SHIFT;
        }
        let id = EnvId::new(generation | idx as u32);
        self.last_ids[idx] = id.into_u32();
        Ok(self.slots[idx].insert(EnvSlot {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            space: AddressSpace::default(),
            upcall: None,
            pending_exofork: false,
            in_upcall: false,
        }))
    }

    pub(crate) fn get(&self, id: EnvId) -> Option<&EnvSlot> {
        self.slots
            .get(id.envx())?
            .as_ref()
            .filter(|env| env.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: EnvId) -> Option<&mut EnvSlot> {
        self.slots
            .get_mut(id.envx())?
            .as_mut()
            .filter(|env| env.id == id)
    }

    pub(crate) fn remove(&mut self, id: EnvId) -> Option<EnvSlot> {
        let slot = self.slots.get_mut(id.envx())?;
        if slot.as_ref().is_some_and(|env| env.id == id) {
            slot.take()
        } else {
            None
        }
    }

    /// Resolve `id` as named by `caller`.
    ///
    /// `0` names the caller. With `checkperm`, the target must be the caller
    /// or one of its immediate children.
    pub(crate) fn resolve(
        &self,
        caller: EnvId,
        id: EnvId,
        checkperm: bool,
    ) -> Result<EnvId, KernelError> {
        if id.is_current() {
            return self.get(caller).map(|env| env.id).ok_or(KernelError::BadEnv);
        }
        let env = self.get(id).ok_or(KernelError::BadEnv)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(env.id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &EnvSlot> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_change_on_reuse() {
        let mut envs = EnvTable::new(2);
        let a = envs.alloc(EnvId::CURRENT).unwrap().id;
        let b = envs.alloc(a).unwrap().id;
        assert_eq!(a.envx(), 0);
        assert_eq!(b.envx(), 1);
        assert_eq!(a.into_u32(), 1 << ENV_GEN_SHIFT);
        assert!(matches!(envs.alloc(a), Err(KernelError::NoFreeEnv)));

        assert!(envs.remove(a).is_some());
        let c = envs.alloc(EnvId::CURRENT).unwrap().id;
        assert_eq!(c.envx(), 0);
        assert_ne!(a, c);
        assert!(envs.get(a).is_none(), "stale id must not resolve");
        assert!(envs.remove(a).is_none());
    }

    #[test]
    fn permission_check() {
        let mut envs = EnvTable::new(4);
        let root = envs.alloc(EnvId::CURRENT).unwrap().id;
        let child = envs.alloc(root).unwrap().id;
        let grandchild = envs.alloc(child).unwrap().id;

        assert_eq!(envs.resolve(root, EnvId::CURRENT, true), Ok(root));
        assert_eq!(envs.resolve(root, child, true), Ok(child));
        assert_eq!(envs.resolve(root, grandchild, true), Err(KernelError::BadEnv));
        assert_eq!(envs.resolve(child, root, true), Err(KernelError::BadEnv));
        assert_eq!(envs.resolve(child, root, false), Ok(root));
        assert_eq!(
            envs.resolve(root, EnvId::new(0x7000), false),
            Err(KernelError::BadEnv)
        );
    }
}
