use bytes::Bytes;
use std::fmt;
use std::fmt::Write;
use std::ops::Deref;

/// A message body: a shared immutable byte buffer plus a per-handle cursor.
///
/// Cloning a `Body` never copies payload bytes; it produces a fresh handle
/// over the same buffer with the cursor rewound to the start. Concurrent
/// read-only hooks each get their own clone, so cursors never interfere.
pub struct Body {
  pub(crate) inner: Bytes,
  cursor: usize,
}

impl Body {
  /// Reposition the cursor to the start of the buffer without copying.
  pub fn reset(&mut self) {
    self.cursor = 0;
  }

  /// Current cursor position.
  pub fn position(&self) -> usize {
    self.cursor
  }

  /// Pull bytes from the cursor into `buf`, advancing the cursor.
  pub fn read(&mut self, buf: &mut [u8]) -> usize {
    let remaining = &self.inner[self.cursor.min(self.inner.len())..];
    let n = remaining.len().min(buf.len());
    buf[..n].copy_from_slice(&remaining[..n]);
    self.cursor += n;
    n
  }

  /// The bytes not yet consumed by this handle's cursor.
  pub fn remaining(&self) -> &[u8] {
    &self.inner[self.cursor.min(self.inner.len())..]
  }

  /// The full underlying buffer, independent of the cursor.
  pub fn bytes(&self) -> &Bytes {
    &self.inner
  }

  /// Whether two handles share one underlying allocation.
  pub fn same_buffer(&self, other: &Body) -> bool {
    self.inner.as_ptr() == other.inner.as_ptr() && self.inner.len() == other.inner.len()
  }
}

impl Clone for Body {
  fn clone(&self) -> Self {
    Body {
      inner: self.inner.clone(),
      cursor: 0,
    }
  }
}

impl PartialEq for Body {
  fn eq(&self, other: &Self) -> bool {
    self.inner == other.inner
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
      cursor: 0,
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b, cursor: 0 }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
      cursor: 0,
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body {
      inner: v.into(),
      cursor: 0,
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match String::from_utf8(self.inner.to_vec()) {
      Ok(s) => fmt::Display::fmt(&s, f),
      Err(_err) => fmt::Display::fmt(
        &self
          .inner
          .as_ref()
          .iter()
          .fold(String::new(), |mut output, b| {
            let _ = write!(output, "\\x{b:02x}");
            output
          }),
        f,
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clone_shares_buffer_with_fresh_cursor() {
    let mut body = Body::from("hello world".to_string());
    let mut buf = [0u8; 5];
    assert_eq!(body.read(&mut buf), 5);
    assert_eq!(&buf, b"hello");

    let clone = body.clone();
    assert_eq!(clone.position(), 0);
    assert!(clone.same_buffer(&body));
    assert_eq!(clone.remaining(), b"hello world");
    // the source cursor is untouched by the clone
    assert_eq!(body.remaining(), b" world");
  }

  #[test]
  fn reset_rewinds_without_copy() {
    let mut body = Body::from("abc".to_string());
    let mut buf = [0u8; 3];
    body.read(&mut buf);
    assert_eq!(body.remaining(), b"");
    let before = body.bytes().as_ptr();
    body.reset();
    assert_eq!(body.remaining(), b"abc");
    assert_eq!(body.bytes().as_ptr(), before);
  }

  #[test]
  fn replacement_is_a_different_buffer() {
    let a = Body::from("same".to_string());
    let b = Body::from("same".to_string());
    assert_eq!(a, b);
    assert!(!a.same_buffer(&b));
  }
}
