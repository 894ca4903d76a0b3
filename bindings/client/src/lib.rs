mod bolt;
mod catalog;
mod diagram;
mod entities;
mod store;

pub mod prelude {
    pub use crate::bolt::BoltGraphStore;
    pub use crate::catalog::{Anchor, BoundQuery, QueryCatalog, QueryDescriptor};
    pub use crate::diagram::{diagram_for, Diagram, DiagramEdge, DiagramNode};
    pub use crate::entities::{EntityBindings, EntityPool, CONTROL_PLANE_NODE};
    pub use crate::store::{GraphStore, RecordingStore, StoreQuery, CLEAR_ALL};
}
