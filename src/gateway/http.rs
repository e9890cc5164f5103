include!("http/core.rs");
include!("http/chat.rs");
include!("http/admin.rs");
