use std::collections::BTreeSet;

use gpurm_engine::Token;

/// Per-connection server state.
#[derive(Debug)]
pub struct Session {
    id: u64,
    initialized: bool,
    engines: BTreeSet<Token>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            initialized: false,
            engines: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub fn holds(&self, token: Token) -> bool {
        self.engines.contains(&token)
    }

    pub fn held_engines(&self) -> impl Iterator<Item = Token> + '_ {
        self.engines.iter().copied()
    }

    pub(crate) fn hold(&mut self, token: Token) {
        self.engines.insert(token);
    }

    pub(crate) fn drop_engine(&mut self, token: Token) {
        self.engines.remove(&token);
    }

    pub(crate) fn take_engines(&mut self) -> BTreeSet<Token> {
        std::mem::take(&mut self.engines)
    }
}
