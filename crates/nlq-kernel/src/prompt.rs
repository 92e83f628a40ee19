/// Builds the completion prompt for a request against a named MySQL database.
///
/// Inputs are embedded verbatim; nothing is rejected or escaped here.
pub fn build_prompt(target_database: &str, natural_language_text: &str) -> String {
    format!(
        "Convert the following natural language query to a valid SQL query \
         for a MySQL database named '{target_database}':\n\n\
         \"{natural_language_text}\"\n\nSQL Query:"
    )
}
