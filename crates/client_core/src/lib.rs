pub mod config;
pub mod error;
pub mod gateway;
pub mod notification;
pub mod optimistic;
pub mod reactions;
pub mod read_receipts;
pub mod resolver;
pub mod timeline;

pub use config::{load_settings, EngineSettings};
pub use error::{ContextError, DecryptError, PayloadError, TrackerError};
pub use gateway::{
    ContextProvider, DecryptRequest, DecryptionGateway, MlsDecryptionGateway,
    OpenMlsContextProvider,
};
pub use notification::{
    Delivery, NotificationContent, NotificationInvocation, NotificationPipeline, NotificationSink,
};
pub use optimistic::{OptimisticMessage, OptimisticTracker, SendState};
pub use read_receipts::ReadReceiptStore;
pub use resolver::resolve_confirmed;
pub use timeline::{
    merge, merge_with_window, ConfirmedContent, ConfirmedEntry, ConfirmedMessage, DisplayMessage,
    SystemMessage,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
