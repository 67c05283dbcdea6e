use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Random alphanumeric suffix for sibling temp files.
pub fn random_suffix(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
