
pub use confuserex::*;
