pub mod dnc;
pub(crate) mod headers;
pub mod guard;
pub mod http;
pub mod litigator;
pub mod person_data;
pub mod sheets;

pub use dnc::{DncClient, DncService};
pub use guard::ServiceGuard;
pub use http::{HttpServiceConfig, JsonServiceClient};
pub use litigator::{LitigatorClient, LitigatorService};
pub use person_data::{PersonDataClient, PersonDataService};
pub use sheets::{SheetsClient, SheetsTarget};
