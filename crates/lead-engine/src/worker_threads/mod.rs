pub mod score_worker;

pub use score_worker::{ScoreHandle, ScoreTicket, ScoreUpdate, ScoreWorker};
