use headers::{Header, HeaderName, HeaderValue};

/// The `Content-Range: <start>-<end>` form used by chunked blob uploads.
/// This is not the RFC 7233 `bytes` form; registry clients send bare
/// offsets.
#[derive(Debug)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
}

static CONTENT_RANGE_NAME: HeaderName = HeaderName::from_static("content-range");

fn decode_range(value: &HeaderValue) -> Result<(u64, u64), headers::Error> {
    let s = value.to_str().map_err(|_| headers::Error::invalid())?;
    let s = s.strip_prefix("bytes ").unwrap_or(s);
    let s = s.split('/').next().unwrap_or(s);
    let ss = s
        .split('-')
        .map(|s| s.trim().parse::<u64>())
        .collect::<Result<Vec<u64>, _>>()
        .map_err(|_| headers::Error::invalid())?;

    if ss.len() != 2 {
        return Err(headers::Error::invalid());
    }
    Ok((ss[0], ss[1]))
}

impl Header for ContentRange {
    fn name() -> &'static HeaderName {
        &CONTENT_RANGE_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let (start, end) = decode_range(value)?;
        Ok(ContentRange { start, end })
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = HeaderValue::from_str(&format!("{}-{}", self.start, self.end))
            .expect("range digits are always a valid header value");
        values.extend(std::iter::once(value))
    }
}

/// The inclusive `Range: 0-<last>` reported back on upload status
/// responses.
#[derive(Debug)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl From<ContentRange> for Range {
    fn from(cr: ContentRange) -> Range {
        Range {
            start: cr.start,
            end: cr.end,
        }
    }
}

impl From<&Range> for String {
    fn from(r: &Range) -> String {
        format!("{}-{}", r.start, r.end)
    }
}

static RANGE_NAME: HeaderName = HeaderName::from_static("range");

impl Header for Range {
    fn name() -> &'static HeaderName {
        &RANGE_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let (start, end) = decode_range(value)?;
        Ok(Range { start, end })
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = HeaderValue::from_str(&format!("{}-{}", self.start, self.end))
            .expect("range digits are always a valid header value");
        values.extend(std::iter::once(value))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::bare("100-199", Some((100, 199)))]
    #[case::rfc_style("bytes 100-199/2000", Some((100, 199)))]
    #[case::missing_end("100-", None)]
    #[case::garbage("cats", None)]
    fn content_range_decoding(#[case] raw: &str, #[case] expected: Option<(u64, u64)>) {
        let value = HeaderValue::from_str(raw).unwrap();
        let decoded = decode_range(&value).ok();
        assert_eq!(decoded, expected);
    }
}
