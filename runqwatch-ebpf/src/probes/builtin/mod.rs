pub mod runqueue;
