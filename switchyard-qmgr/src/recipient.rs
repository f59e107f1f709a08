use crate::arena::DestinationId;

/// One envelope recipient as read from a queue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Offset of the recipient record, for marking it done
    pub offset: u64,
    /// Address as originally given, before any rewriting
    pub original: String,
    pub address: String,
    /// Set once the address has been resolved to a destination
    pub destination: Option<DestinationId>,
}

impl Recipient {
    #[must_use]
    pub fn new(offset: u64, original: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            offset,
            original: original.into(),
            address: address.into(),
            destination: None,
        }
    }
}

/// Ordered recipients, either freshly read or bundled into an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientBatch {
    recipients: Vec<Recipient>,
}

impl RecipientBatch {
    pub fn push(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.recipients.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Recipient> {
        self.recipients.iter_mut()
    }

    pub fn clear(&mut self) {
        self.recipients.clear();
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<Recipient> {
        &mut self.recipients
    }

    /// Hand over every recipient, leaving the batch empty.
    pub fn take(&mut self) -> Vec<Recipient> {
        std::mem::take(&mut self.recipients)
    }
}

impl<'a> IntoIterator for &'a RecipientBatch {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Recipient> for RecipientBatch {
    fn from_iter<T: IntoIterator<Item = Recipient>>(iter: T) -> Self {
        Self {
            recipients: iter.into_iter().collect(),
        }
    }
}
