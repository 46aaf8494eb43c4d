#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source for the seeds of connection ids and starting packet sequence numbers
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::random::<u32>()
    }
}
