use crate::model::ComparePolicy;

/// Decides whether a program's captured stdout matches the expected output.
///
/// Never fails: output that is not valid UTF-8 is compared lossily, which can
/// only make it mismatch.
pub fn outputs_match(policy: ComparePolicy, program_output: &[u8], expected_output: &str) -> bool {
    match policy {
        ComparePolicy::Exact => program_output == expected_output.as_bytes(),
        ComparePolicy::Trimmed => {
            compare_output_trimmed(&String::from_utf8_lossy(program_output), expected_output)
        }
        ComparePolicy::Tokens => {
            compare_output_tokens(&String::from_utf8_lossy(program_output), expected_output)
        }
    }
}

/// Ignores trailing spaces on each line and trailing empty lines.
fn compare_output_trimmed(program_output: &str, expected_output: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string()
    };

    normalize(program_output) == normalize(expected_output)
}

/// Compares whitespace-separated token sequences, so line breaks and spacing
/// do not matter.
fn compare_output_tokens(program_output: &str, expected_output: &str) -> bool {
    program_output
        .split_whitespace()
        .eq(expected_output.split_whitespace())
}
