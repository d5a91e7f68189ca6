pub mod buf;
pub mod random;
pub mod timer_heap;
