//! Подготовка текста перед отправкой провайдеру

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref BRACKET_CUE_REGEX: Regex = Regex::new(r"\[(?:music|applause|laughter|музыка|смех)\]").unwrap();
}

/// Удалить разметку, раскрыть HTML-сущности и нормализовать пробелы
pub fn prepare_text_for_tts(text: &str) -> String {
    let text = TAG_REGEX.replace_all(text, "");
    let text = BRACKET_CUE_REGEX.replace_all(&text, " ");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}
