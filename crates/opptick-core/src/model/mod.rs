mod opportunity;
mod reminder;
mod session;

pub use opportunity::*;
pub use reminder::*;
pub use session::*;
