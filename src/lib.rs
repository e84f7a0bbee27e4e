mod message;
mod network;
mod rank;
mod service;

pub use message::{
    AddrRequest, ControlMessage, EntityAddr, EntityType, LookupStatus, Message, RegisterResult,
    MSG_TYPE_USER_BASE, RANK_UNASSIGNED,
};
pub use network::{Connection, Frame, FrameCodec, Hello, Sender, FRAME_HEADER_LEN};
pub use rank::{
    Dispatcher, EntityMessenger, EntityState, Messenger, Namer, Rank, RankStats,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, MessengerConfig, NamerConfig,
    NetworkConfig, ReaperConfig, RuntimeConfig, SenderConfig, Shutdown, TimeoutConfig,
    TracingGuard,
};
