// handlers/mod.rs - two security tiers
//
// Public (no auth): /auth/*, /webhooks/*
// Protected (JWT + live session): /api/*

pub mod protected;
pub mod public;
