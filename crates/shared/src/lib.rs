//! Wire vocabulary shared between the sync core and its collaborators.

pub mod domain;
pub mod error;
pub mod protocol;
