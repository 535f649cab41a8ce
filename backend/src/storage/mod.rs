pub mod overlay_store;
