mod appservice;
mod sync;
