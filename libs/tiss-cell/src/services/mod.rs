pub mod batch;
pub mod deep_search;
pub mod guide;
pub mod notification;
pub mod numbering;
pub mod returns;
pub mod scheduler;
pub mod store;
pub mod xml;
pub mod xml_reader;

pub use batch::BatchService;
pub use guide::GuideService;
pub use notification::{BatchNotifier, MailClient};
pub use returns::ReturnProcessingService;
pub use scheduler::spawn_monthly_batching;
pub use store::TissStore;
pub use xml::{TissXmlGenerator, XmlExportService};
