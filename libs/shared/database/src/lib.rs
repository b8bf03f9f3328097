pub mod supabase;

pub use supabase::{DbResult, SupabaseClient, SupabaseError};
