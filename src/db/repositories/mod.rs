mod durations;
mod events;
mod metrics;
mod sessions;
