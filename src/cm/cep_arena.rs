use std::fmt::{Display, Formatter};

use crate::cm::cep::Cep;
use crate::cm::cm_error::CmError;


/// Handle of a CEP. A handle stays invalid once its CEP was destroyed, even if the slot is
///  reused for a new CEP.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CepId {
    index: u32,
    generation: u32,
}
impl Display for CepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cep#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    cep: Option<Cep>,
}

#[derive(Default)]
pub struct CepArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl CepArena {
    pub fn insert(&mut self, cep: Cep) -> CepId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.cep = Some(cep);
            CepId { index, generation: slot.generation }
        }
        else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, cep: Some(cep) });
            CepId { index, generation: 0 }
        }
    }

    pub fn get(&self, id: CepId) -> Result<&Cep, CmError> {
        match self.slots.get(id.index as usize) {
            Some(Slot { generation, cep: Some(cep) }) if *generation == id.generation => Ok(cep),
            _ => Err(CmError::NotFound),
        }
    }

    pub fn get_mut(&mut self, id: CepId) -> Result<&mut Cep, CmError> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot { generation, cep: Some(cep) }) if *generation == id.generation => Ok(cep),
            _ => Err(CmError::NotFound),
        }
    }

    pub fn contains(&self, id: CepId) -> bool {
        self.get(id).is_ok()
    }

    pub fn remove(&mut self, id: CepId) -> Option<Cep> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let cep = slot.cep.take()?;
        self.free.push(id.index);
        Some(cep)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<CepId> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, s)| s.cep.is_some())
            .map(|(index, s)| CepId { index: index as u32, generation: s.generation })
            .collect()
    }
}
