// Messages exchanged with collaborators outside the core.

pub mod update;
