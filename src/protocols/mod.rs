// Protocol definitions for the OpenAI-compatible chat-completion surface

pub mod chat;
