use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre le kernel et ses tâches (handles de workers, pools).
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
