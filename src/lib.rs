// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod manager;
pub mod queue;
pub mod receiver;
pub mod session;
pub mod topology;
