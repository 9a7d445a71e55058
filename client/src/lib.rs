mod console;
mod http;

pub use console::{ConsoleClient, ConsoleConnection, ConsoleEvent};
pub use http::{ApiResponse, ClientError, HttpClient, Session, CLIENT_ID_HEADER, TOKEN_HEADER};
