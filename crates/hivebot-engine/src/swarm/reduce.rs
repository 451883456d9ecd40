//! Reduce strategies — collapsing successful batch results into one text.
//!
//! `concatenate` is pure; `summarize` and `hierarchical` invoke the reducer
//! agent and are orchestrated by the engine. This module holds the pure
//! pieces: joining, chunking, and the default prompt.

/// Separator between concatenated batch or partition results.
pub const RESULT_SEPARATOR: &str = "\n\n---\n\n";

/// Default prompt for `summarize` and for hierarchical chunk reduction.
pub const DEFAULT_SUMMARIZE_PROMPT: &str = "Combine the following results into a single coherent report. Preserve\n\
every distinct finding and drop exact repetitions.\n\n\
{{items}}\n\n\
Original request: {{user_message}}";

/// Join results in batch order.
pub fn concatenate(results: &[String]) -> String {
    results.join(RESULT_SEPARATOR)
}

/// Split results into reduction chunks of at most `fanin` entries.
pub fn chunk(results: &[String], fanin: usize) -> Vec<Vec<String>> {
    results.chunks(fanin.max(1)).map(<[String]>::to_vec).collect()
}
