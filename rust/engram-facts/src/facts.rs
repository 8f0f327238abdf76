mod address;
pub use address::*;

mod change;
pub use change::*;

mod commit;
pub use commit::*;

mod entity;
pub use entity::*;

mod fact;
pub use fact::*;

mod inline;
pub use inline::*;

mod media_type;
pub use media_type::*;

mod revision;
pub use revision::*;

pub mod selector;
pub use selector::{FactSelector, QuerySelector, SchemaSelector};

mod space;
pub use space::*;
