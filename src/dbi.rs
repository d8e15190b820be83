//! Named sub-database handles.
//!
//! There is no separate handle type: `open_dbi` hands back the [`Tree`]
//! itself (root pointer plus DUPSORT/DUPFIXED/INTEGERKEY flags), and the
//! transaction keeps its own name-keyed table of every `Tree` it has opened
//! or created so a commit knows what to flush back into `MainDBI`. Callers
//! that mutate a tree (via `WriteTxn::put`/`del` or a `Cursor`) must feed the
//! possibly-new root back with [`crate::txn::WriteTxn::update_dbi`].

pub use crate::btree::Tree as Dbi;
pub use crate::flags::dbi::{CREATE, DUPFIXED, DUPSORT, INTEGERKEY};
