use crate::error::{ArtmError, Result};
use crate::model::phi_matrix::{increase_cells, AtomicF32, PhiMatrix, SpinLock};
use crate::model::token::TokenCollection;

/// Phi matrix whose weights live in caller supplied memory.
///
/// The buffer is token-major (`token_size * topic_size` floats). The view
/// borrows it for `'a` and never outlives, frees or reallocates it; the token
/// set is fixed at attach time.
#[derive(Debug)]
pub struct AttachedPhiMatrix<'a> {
    model_name: String,
    topic_names: Vec<String>,
    tokens: TokenCollection,
    cells: &'a [AtomicF32],
    locks: Vec<SpinLock>,
}

impl<'a> AttachedPhiMatrix<'a> {
    /// Attach a view over `buffer` without touching its contents.
    pub fn attach(
        model_name: impl Into<String>,
        tokens: TokenCollection,
        topic_names: Vec<String>,
        buffer: &'a mut [f32],
    ) -> Result<Self> {
        let expected = tokens.len() * topic_names.len();
        if buffer.len() != expected {
            return Err(ArtmError::invalid(format!(
                "attached buffer holds {} floats, expected {} ({} tokens x {} topics)",
                buffer.len(),
                expected,
                tokens.len(),
                topic_names.len()
            )));
        }
        let len = buffer.len();
        // SAFETY: AtomicF32 is repr(transparent) over AtomicU32, which has the
        // size and alignment of f32. `buffer` is borrowed exclusively for 'a,
        // so every access during 'a goes through the atomic view.
        let cells = unsafe { std::slice::from_raw_parts(buffer.as_mut_ptr() as *const AtomicF32, len) };
        let locks = (0..tokens.len()).map(|_| SpinLock::default()).collect();
        Ok(Self {
            model_name: model_name.into(),
            topic_names,
            tokens,
            cells,
            locks,
        })
    }

    /// Attach a view over `buffer` after copying `source` into it.
    pub fn attach_copy(source: &dyn PhiMatrix, buffer: &'a mut [f32]) -> Result<Self> {
        let topic_size = source.topic_size();
        if buffer.len() != source.token_size() * topic_size {
            return Err(ArtmError::invalid(format!(
                "attached buffer holds {} floats, expected {}",
                buffer.len(),
                source.token_size() * topic_size
            )));
        }
        if topic_size > 0 {
            for (token_id, row) in buffer.chunks_mut(topic_size).enumerate() {
                source.get_row(token_id, row);
            }
        }
        Self::attach(
            source.model_name().to_string(),
            source.tokens().clone(),
            source.topic_names().to_vec(),
            buffer,
        )
    }

    #[inline]
    fn row(&self, token_id: usize) -> &[AtomicF32] {
        let topic_size = self.topic_names.len();
        &self.cells[token_id * topic_size..(token_id + 1) * topic_size]
    }
}

impl PhiMatrix for AttachedPhiMatrix<'_> {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn topic_size(&self) -> usize {
        self.topic_names.len()
    }

    fn token_size(&self) -> usize {
        self.tokens.len()
    }

    fn topic_names(&self) -> &[String] {
        &self.topic_names
    }

    fn tokens(&self) -> &TokenCollection {
        &self.tokens
    }

    #[inline]
    fn get(&self, token_id: usize, topic_id: usize) -> f32 {
        self.row(token_id)[topic_id].load()
    }

    #[inline]
    fn get_row(&self, token_id: usize, out: &mut [f32]) {
        for (o, cell) in out.iter_mut().zip(self.row(token_id)) {
            *o = cell.load();
        }
    }

    #[inline]
    fn set(&self, token_id: usize, topic_id: usize, value: f32) {
        self.row(token_id)[topic_id].store(value);
    }

    #[inline]
    fn increase(&self, token_id: usize, topic_id: usize, delta: f32) {
        let _guard = self.locks[token_id].lock();
        let cell = &self.row(token_id)[topic_id];
        cell.store(cell.load() + delta);
    }

    #[inline]
    fn increase_row(&self, token_id: usize, delta: &[f32]) {
        increase_cells(&self.locks[token_id], self.row(token_id), delta);
    }

    fn byte_size(&self) -> usize {
        // 外部メモリは数えない
        self.locks.len() * std::mem::size_of::<SpinLock>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::phi_matrix::{default_topic_names, DensePhiMatrix};
    use crate::model::token::Token;

    #[test]
    fn writes_land_in_external_buffer() {
        let tokens: TokenCollection = vec![Token::word("a"), Token::word("b")].into_iter().collect();
        let mut buffer = vec![0.0f32; 4];
        {
            let view = AttachedPhiMatrix::attach("m", tokens, default_topic_names(2), &mut buffer).unwrap();
            view.set(0, 1, 0.5);
            view.increase_row(1, &[1.0, 2.0]);
            assert_eq!(view.get(1, 1), 2.0);
        }
        assert_eq!(buffer, vec![0.0, 0.5, 1.0, 2.0]);
    }

    #[test]
    fn attach_copy_mirrors_source() {
        let mut source = DensePhiMatrix::new("pwt", default_topic_names(3));
        source.add_token(Token::word("x"));
        source.add_token(Token::word("y"));
        source.set_row(1, &[0.1, 0.2, 0.7]);

        let mut buffer = vec![0.0f32; 6];
        let view = AttachedPhiMatrix::attach_copy(&source, &mut buffer).unwrap();
        assert_eq!(view.token_index(&Token::word("y")), Some(1));
        assert_eq!(view.get(1, 2), 0.7);
        drop(view);
        assert_eq!(&buffer[3..], &[0.1, 0.2, 0.7]);
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let tokens: TokenCollection = vec![Token::word("a")].into_iter().collect();
        let mut buffer = vec![0.0f32; 3];
        assert!(AttachedPhiMatrix::attach("m", tokens, default_topic_names(2), &mut buffer).is_err());
    }
}
