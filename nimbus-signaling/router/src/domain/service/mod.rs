pub mod bus_router;

pub use bus_router::{MessageBusRouter, NodePublish, RouteReport};
