use regex::Regex;

const IMPORT_HINTS: &[(&str, &str)] = &[
    ("subprocess.", "import subprocess"),
    ("ET.", "import xml.etree.ElementTree as ET"),
    ("Path(", "from pathlib import Path"),
    ("MagicMock", "from unittest.mock import patch, MagicMock"),
    ("patch(", "from unittest.mock import patch, MagicMock"),
    ("pytest.raises", "import pytest"),
    ("pytest.fixture", "import pytest"),
];

pub fn postprocess(raw: &str) -> String {
    let code = strip_fences(raw);
    let code = inject_missing_imports(&code);
    widen_side_effect_lambdas(&code)
}

pub fn strip_fences(raw: &str) -> String {
    let mut code = raw.trim().to_string();
    if let Ok(open) = Regex::new(r"^```\w*\n") {
        code = open.replace(&code, "").to_string();
    }
    if let Ok(close) = Regex::new(r"\n```$") {
        code = close.replace(&code, "").to_string();
    }
    code.trim().to_string()
}

pub fn inject_missing_imports(code: &str) -> String {
    let lines: Vec<&str> = code.split('\n').collect();
    let existing: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| is_import(l))
        .collect();
    let existing = existing.join("\n");

    let mut missing: Vec<&str> = Vec::new();
    for &(token, statement) in IMPORT_HINTS {
        if code.contains(token) && !existing.contains(statement) && !missing.contains(&statement) {
            missing.push(statement);
        }
    }
    if missing.is_empty() {
        return code.to_string();
    }

    let insert_at = lines
        .iter()
        .position(|l| !l.trim().is_empty() && !is_import(l) && !l.starts_with('#'))
        .unwrap_or(lines.len());

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + missing.len() + 1);
    out.extend_from_slice(&lines[..insert_at]);
    out.extend(missing);
    out.push("");
    out.extend_from_slice(&lines[insert_at..]);
    out.join("\n")
}

fn is_import(line: &str) -> bool {
    line.starts_with("import") || line.starts_with("from")
}

/// Lambdas whose body reads the parameter are left unchanged.
pub fn widen_side_effect_lambdas(code: &str) -> String {
    let Ok(re) = Regex::new(r"(side_effect\s*=\s*lambda)\s+([A-Za-z_][A-Za-z0-9_]*)\s*:") else {
        return code.to_string();
    };
    let mut out = String::with_capacity(code.len());
    let mut last = 0;
    for caps in re.captures_iter(code) {
        let (Some(whole), Some(head), Some(param)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let rest = &code[whole.end()..];
        let body = rest.split('\n').next().unwrap_or_default();
        if mentions(body, param.as_str()) {
            continue;
        }
        out.push_str(&code[last..whole.start()]);
        out.push_str(head.as_str());
        out.push_str(" *args, **kwargs:");
        last = whole.end();
    }
    out.push_str(&code[last..]);
    out
}

fn mentions(body: &str, name: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(name)))
        .map(|re| re.is_match(body))
        .unwrap_or(true)
}
